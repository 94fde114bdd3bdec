//! The account manager: root of the mission tree and index of accounts.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use switchboard_core::{
    AggregateWait, InhibitSlot, Operation, Proxy, Target, Transport, WeakTarget,
};
use switchboard_ipc::{
    iface, props, AccountId, BrokerError, InterfaceKey, ObjectPath, StorageEvent,
};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::account::{Account, AccountFeature};

struct ManagerInner {
    root: Operation,
    proxy: Proxy,
    transport: Rc<dyn Transport>,
    inhibit: InhibitSlot,
    accounts: RefCell<BTreeMap<AccountId, Account>>,
    lifetime: Target,
}

#[derive(Clone)]
pub struct AccountManager {
    inner: Rc<ManagerInner>,
}

fn manager_key() -> InterfaceKey {
    InterfaceKey::new(iface::ACCOUNT_MANAGER)
}

impl AccountManager {
    pub fn new(transport: Rc<dyn Transport>, inhibit: InhibitSlot) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                root: Operation::new("account-manager"),
                proxy: Proxy::new(ObjectPath::account_manager(), transport.clone()),
                transport,
                inhibit,
                accounts: RefCell::new(BTreeMap::new()),
                lifetime: Target::new(),
            }),
        }
    }

    pub fn root(&self) -> &Operation {
        &self.inner.root
    }

    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    pub fn inhibit_slot(&self) -> &InhibitSlot {
        &self.inner.inhibit
    }

    pub fn weak_target(&self) -> WeakTarget {
        self.inner.lifetime.downgrade()
    }

    pub fn account(&self, id: &AccountId) -> Option<Account> {
        self.inner.accounts.borrow().get(id).cloned()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.inner.accounts.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.accounts.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the manager interface, then bring the account set in line
    /// with its account lists.
    pub fn prepare<F>(&self, callback: F) -> bool
    where
        F: FnOnce(Result<(), BrokerError>) + 'static,
    {
        let manager = self.downgrade();
        self.inner.proxy.register(
            &manager_key(),
            move |result| {
                if result.is_ok() {
                    if let Some(manager) = manager.upgrade() {
                        manager.sync_accounts();
                    }
                }
                callback(result);
            },
            Some(&self.weak_target()),
        )
    }

    /// Wait for `features` on every current account. Returns the number of
    /// fetches sent.
    pub fn prepare_accounts<F>(&self, features: &[AccountFeature], callback: F) -> usize
    where
        F: FnOnce(Result<(), BrokerError>) + 'static,
    {
        let weak_target = self.weak_target();
        let aggregate = AggregateWait::new(callback, Some(&weak_target));
        let mut fetches = 0;
        for account in self.accounts() {
            for feature in features {
                if aggregate.track(account.proxy(), &feature.key()) {
                    fetches += 1;
                }
            }
        }
        aggregate.finish();
        fetches
    }

    fn listed_accounts(&self) -> Option<Vec<AccountId>> {
        let key = manager_key();
        let mut ids = Vec::new();
        for name in [props::VALID_ACCOUNTS, props::INVALID_ACCOUNTS] {
            let paths = self.inner.proxy.property(&key, name)?;
            let paths: Vec<ObjectPath> = match serde_json::from_value(paths) {
                Ok(paths) => paths,
                Err(err) => {
                    log::warn!("manager: malformed {}: {}", name, err);
                    continue;
                }
            };
            ids.extend(paths.iter().filter_map(AccountId::from_path));
        }
        Some(ids)
    }

    /// Add accounts the manager lists and abort the ones it no longer does.
    pub fn sync_accounts(&self) {
        let Some(listed) = self.listed_accounts() else {
            return;
        };
        let stale: Vec<Account> = self
            .inner
            .accounts
            .borrow()
            .iter()
            .filter(|(id, _)| !listed.contains(id))
            .map(|(_, account)| account.clone())
            .collect();
        for account in stale {
            log::debug!("manager: {} no longer listed", account.id());
            account.mission().abort();
        }
        for id in listed {
            self.add_account(id);
        }
    }

    /// The account for `id`, created and taken into the tree if new.
    pub fn add_account(&self, id: AccountId) -> Account {
        if let Some(account) = self.account(&id) {
            return account;
        }
        let account = Account::new(
            id.clone(),
            self.inner.transport.clone(),
            self.inner.inhibit.clone(),
        );
        let manager = self.downgrade();
        let forget = id.clone();
        account.mission().connect_abort(move |_| {
            if let Some(manager) = manager.upgrade() {
                let removed = manager.inner.accounts.borrow_mut().remove(&forget);
                drop(removed);
            }
        });
        self.inner
            .accounts
            .borrow_mut()
            .insert(id.clone(), account.clone());
        log::debug!("manager: tracking {}", id);
        self.inner.root.take_mission(account.mission());
        account
    }

    pub fn handle_storage_event(&self, event: &StorageEvent) {
        log::debug!("manager: storage event for {}: {:?}", event.account(), event);
        match event {
            StorageEvent::Created { account } => {
                self.add_account(account.clone());
                self.resync();
            }
            StorageEvent::Altered { account, setting } => {
                if let Some(account) = self.account(account) {
                    account.reload(AccountFeature::for_setting(setting));
                }
            }
            StorageEvent::Toggled { account, enabled } => {
                let Some(account) = self.account(account) else {
                    return;
                };
                account.reload(AccountFeature::Core);
                if *enabled {
                    if !self.inner.root.is_connected() {
                        return;
                    }
                    if account.mission().is_connected() {
                        account.connect_if_enabled();
                    } else {
                        account.mission().connect();
                    }
                } else {
                    account.mission().disconnect();
                }
            }
            StorageEvent::Deleted { account } => {
                if let Some(account) = self.account(account) {
                    account.mission().abort();
                }
                self.resync();
            }
        }
    }

    /// Refetch the manager interface and sync the account set against it.
    pub fn resync(&self) {
        self.inner.proxy.refresh(&manager_key());
        self.prepare(|result| match result {
            Ok(()) => log::debug!("manager: resynced"),
            Err(err) => log::warn!("manager: resync failed: {}", err),
        });
    }

    fn downgrade(&self) -> WeakAccountManager {
        WeakAccountManager {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("root", &self.inner.root)
            .field("accounts", &self.inner.accounts.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

struct WeakAccountManager {
    inner: Weak<ManagerInner>,
}

impl WeakAccountManager {
    fn upgrade(&self) -> Option<AccountManager> {
        self.inner.upgrade().map(|inner| AccountManager { inner })
    }
}

/// Feed storage events into `manager` until the channel closes.
///
/// `before` runs first for each event, so the far end can update its own
/// state before the manager refetches.
pub async fn pump_storage_events(
    manager: AccountManager,
    mut events: broadcast::Receiver<StorageEvent>,
    before: impl Fn(&StorageEvent),
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                before(&event);
                manager.handle_storage_event(&event);
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("manager: {} storage events lost, resyncing", skipped);
                manager.resync();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
