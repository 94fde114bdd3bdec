//! One account: a mission in the manager's tree, a proxy for its bus object,
//! and the channel requests made against it.

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde_json::Value;
use switchboard_core::{
    wait_all, InhibitSlot, Mission, MissionHandler, Operation, Proxy, Reply, RequestHandle,
    RequestOutcome, RequestTracker, Target, Transport, WeakTarget,
};
use switchboard_ipc::{
    iface, methods, props, AccountId, BrokerError, ChannelRequestParams, ConnectionStatus,
    InterfaceKey, ObjectPath, PropertyMap,
};

/// Interfaces an account object may serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountFeature {
    Core,
    Avatar,
    Compat,
    Conditions,
    Stats,
}

impl AccountFeature {
    pub const ALL: [AccountFeature; 5] = [
        Self::Core,
        Self::Avatar,
        Self::Compat,
        Self::Conditions,
        Self::Stats,
    ];

    pub fn interface(self) -> &'static str {
        match self {
            Self::Core => iface::ACCOUNT,
            Self::Avatar => iface::ACCOUNT_AVATAR,
            Self::Compat => iface::ACCOUNT_COMPAT,
            Self::Conditions => iface::ACCOUNT_CONDITIONS,
            Self::Stats => iface::ACCOUNT_STATS,
        }
    }

    pub fn key(self) -> InterfaceKey {
        InterfaceKey::new(self.interface())
    }

    /// The feature whose interface carries the stored `setting`.
    pub fn for_setting(setting: &str) -> Self {
        match setting {
            props::AVATAR_MIME | props::AVATAR_DATA => Self::Avatar,
            props::SECONDARY_VCARD_FIELDS => Self::Compat,
            props::CONDITIONS => Self::Conditions,
            _ => Self::Core,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Avatar {
    pub mime_type: String,
    pub data: String,
}

struct AccountInner {
    id: AccountId,
    operation: Operation,
    proxy: Proxy,
    requests: RequestTracker,
    inhibit: InhibitSlot,
    lifetime: Target,
}

/// Cheap to clone; clones share the account.
#[derive(Clone)]
pub struct Account {
    inner: Rc<AccountInner>,
}

impl Account {
    pub fn new(id: AccountId, transport: Rc<dyn Transport>, inhibit: InhibitSlot) -> Self {
        let path = id.path();
        let inner = Rc::new(AccountInner {
            operation: Operation::new(id.as_str()),
            proxy: Proxy::new(path.clone(), transport.clone()),
            requests: RequestTracker::new(path, transport),
            inhibit,
            lifetime: Target::new(),
            id,
        });
        inner.operation.set_handler(Rc::new(AccountMission {
            account: Rc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn id(&self) -> &AccountId {
        &self.inner.id
    }

    pub fn path(&self) -> &ObjectPath {
        self.inner.proxy.path()
    }

    pub fn mission(&self) -> &Operation {
        &self.inner.operation
    }

    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.inner.requests
    }

    /// Released with the account; ties callbacks to its lifetime.
    pub fn weak_target(&self) -> WeakTarget {
        self.inner.lifetime.downgrade()
    }

    pub fn is_ready(&self, feature: AccountFeature) -> bool {
        self.inner.proxy.is_ready(&feature.key())
    }

    /// Call `callback` once every feature in `features` is ready, or with
    /// the first error. Returns the number of fetches sent.
    pub fn prepare<F>(
        &self,
        features: &[AccountFeature],
        callback: F,
        weak_target: Option<&WeakTarget>,
    ) -> usize
    where
        F: FnOnce(Result<(), BrokerError>) + 'static,
    {
        let keys: Vec<InterfaceKey> = features.iter().map(|feature| feature.key()).collect();
        wait_all(&self.inner.proxy, &keys, callback, weak_target)
    }

    /// Drop the cached state of `feature`; the next prepare refetches it.
    pub fn refresh(&self, feature: AccountFeature) {
        self.inner.proxy.refresh(&feature.key());
    }

    /// Drop the cached state of `feature` and fetch it again right away.
    pub fn reload(&self, feature: AccountFeature) {
        self.refresh(feature);
        let id = self.id().clone();
        self.prepare(
            &[feature],
            move |result| {
                if let Err(err) = result {
                    log::warn!("account({}): reloading {:?} failed: {}", id, feature, err);
                }
            },
            Some(&self.weak_target()),
        );
    }

    pub fn request_channel<F>(
        &self,
        params: ChannelRequestParams,
        callback: F,
        weak_target: Option<&WeakTarget>,
    ) -> RequestHandle
    where
        F: FnOnce(RequestOutcome) + 'static,
    {
        self.inner.requests.submit(params, callback, weak_target)
    }

    fn value(&self, feature: AccountFeature, name: &str) -> Option<Value> {
        self.inner.proxy.property(&feature.key(), name)
    }

    fn string(&self, feature: AccountFeature, name: &str) -> Option<String> {
        self.value(feature, name)
            .and_then(|value| value.as_str().map(str::to_owned))
    }

    pub fn display_name(&self) -> Option<String> {
        self.string(AccountFeature::Core, props::DISPLAY_NAME)
    }

    pub fn enabled(&self) -> Option<bool> {
        self.value(AccountFeature::Core, props::ENABLED)
            .and_then(|value| value.as_bool())
    }

    pub fn valid(&self) -> Option<bool> {
        self.value(AccountFeature::Core, props::VALID)
            .and_then(|value| value.as_bool())
    }

    pub fn nickname(&self) -> Option<String> {
        self.string(AccountFeature::Core, props::NICKNAME)
    }

    pub fn icon(&self) -> Option<String> {
        self.string(AccountFeature::Core, props::ICON)
    }

    pub fn parameters(&self) -> Option<PropertyMap> {
        match self.value(AccountFeature::Core, props::PARAMETERS)? {
            Value::Object(map) => Some(map.into_iter().collect()),
            _ => None,
        }
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.value(AccountFeature::Core, props::CONNECTION_STATUS)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn avatar(&self) -> Option<Avatar> {
        Some(Avatar {
            mime_type: self.string(AccountFeature::Avatar, props::AVATAR_MIME)?,
            data: self.string(AccountFeature::Avatar, props::AVATAR_DATA)?,
        })
    }

    pub fn secondary_vcard_fields(&self) -> Option<Vec<String>> {
        self.value(AccountFeature::Compat, props::SECONDARY_VCARD_FIELDS)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn conditions(&self) -> Option<BTreeMap<String, String>> {
        self.value(AccountFeature::Conditions, props::CONDITIONS)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn channel_count(&self) -> Option<u64> {
        self.value(AccountFeature::Stats, props::CHANNEL_COUNT)
            .and_then(|value| value.as_u64())
    }

    fn call(&self, method: &'static str, reply: Reply<Value>) {
        log::debug!("account({}): {}", self.id(), method);
        self.inner
            .proxy
            .transport()
            .issue_call(self.path(), method, PropertyMap::new(), reply);
    }

    /// Ask the far end to connect once the core interface says the account
    /// is enabled. Skipped if the mission went down meanwhile.
    pub(crate) fn connect_if_enabled(&self) {
        let weak = Rc::downgrade(&self.inner);
        let key = AccountFeature::Core.key();
        self.inner.proxy.register(
            &key,
            move |result| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let account = Account { inner };
                if let Err(err) = result {
                    log::warn!(
                        "account({}): cannot read state before connect: {}",
                        account.id(),
                        err
                    );
                    return;
                }
                if !account.mission().is_connected() || account.enabled() != Some(true) {
                    log::debug!("account({}): not connecting, disabled or offline", account.id());
                    return;
                }
                let id = account.id().clone();
                account.call(
                    methods::CONNECT,
                    Reply::new("connect", move |result| {
                        if let Err(err) = result {
                            log::warn!("account({}): connect failed: {}", id, err);
                        }
                    }),
                );
            },
            Some(&self.weak_target()),
        );
    }

    /// Disconnect on the far end, holding the shutdown inhibitor, if any,
    /// until the reply arrives.
    fn disconnect_remote(&self) {
        let hold = self.inner.inhibit.hold();
        let id = self.id().clone();
        self.call(
            methods::DISCONNECT,
            Reply::new("disconnect", move |result| {
                if let Err(err) = result {
                    log::warn!("account({}): disconnect failed: {}", id, err);
                }
                drop(hold);
            }),
        );
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.inner.id)
            .field("connected", &self.inner.operation.is_connected())
            .field("aborted", &self.inner.operation.is_aborted())
            .finish()
    }
}

struct AccountMission {
    account: Weak<AccountInner>,
}

impl AccountMission {
    fn account(&self) -> Option<Account> {
        self.account.upgrade().map(|inner| Account { inner })
    }
}

impl MissionHandler for AccountMission {
    fn connected(&self, _mission: &Mission) {
        if let Some(account) = self.account() {
            account.connect_if_enabled();
        }
    }

    fn disconnected(&self, _mission: &Mission) {
        if let Some(account) = self.account() {
            account.disconnect_remote();
        }
    }

    fn aborted(&self, _mission: &Mission) {
        let Some(account) = self.account() else {
            return;
        };
        log::info!("account({}): removed", account.id());
        let error = BrokerError::invalidated("account removed");
        account.inner.proxy.invalidate(error.clone());
        account.inner.requests.fail_all(error);
    }
}
