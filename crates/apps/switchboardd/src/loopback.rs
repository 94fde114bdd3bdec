//! In-process far end serving the broker's objects from the storage registry.
//!
//! Every call completes without suspending, so replies arrive on the next
//! turn of the local executor. Signals go out on one broadcast channel.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::{json, Value};
use switchboard_ipc::{
    iface, methods, props, AccountId, BrokerError, BusMethods, BusProperties, BusSignal,
    BusSignals, ChannelRequestParams, ConnectionStatus, InterfaceKey, ObjectPath, PropertyMap,
    RequestEvent, SignalKind, StorageEvent,
};
use tokio::sync::broadcast;

use crate::storage::StorageRegistry;

pub const TEXT_CHANNEL: &str = "im.switchboard.Channel.Type.Text";
pub const CALL_CHANNEL: &str = "im.switchboard.Channel.Type.Call";

const CORE_SETTINGS: &[&str] = &[props::DISPLAY_NAME, props::NICKNAME, props::ICON];

struct PendingRequest {
    account: AccountId,
    params: ChannelRequestParams,
}

pub struct LoopbackBus {
    storage: Rc<StorageRegistry>,
    signals: broadcast::Sender<BusSignal>,
    status: RefCell<HashMap<AccountId, ConnectionStatus>>,
    channel_counts: RefCell<HashMap<AccountId, u64>>,
    requests: RefCell<HashMap<ObjectPath, PendingRequest>>,
    next_request: Cell<u64>,
    channel_types: BTreeSet<String>,
    managers: Option<BTreeSet<String>>,
}

impl LoopbackBus {
    /// Serves every account in `storage`, accepting text and call channels.
    pub fn new(storage: Rc<StorageRegistry>) -> Self {
        Self {
            storage,
            signals: broadcast::channel(256).0,
            status: RefCell::new(HashMap::new()),
            channel_counts: RefCell::new(HashMap::new()),
            requests: RefCell::new(HashMap::new()),
            next_request: Cell::new(1),
            channel_types: [TEXT_CHANNEL, CALL_CHANNEL].map(String::from).into(),
            managers: None,
        }
    }

    /// Accept only these channel types; `Proceed` fails the rest.
    pub fn with_channel_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Only accounts of these connection managers are valid.
    pub fn with_managers<I, S>(mut self, managers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.managers = Some(managers.into_iter().map(Into::into).collect());
        self
    }

    pub fn storage(&self) -> &Rc<StorageRegistry> {
        &self.storage
    }

    pub fn status(&self, account: &AccountId) -> ConnectionStatus {
        self.status
            .borrow()
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    pub fn channel_count(&self, account: &AccountId) -> u64 {
        self.channel_counts
            .borrow()
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    /// Channel requests created but neither proceeded nor cancelled.
    pub fn pending_requests(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn is_valid(&self, account: &AccountId) -> bool {
        self.managers
            .as_ref()
            .map_or(true, |managers| managers.contains(account.manager()))
    }

    /// Mirror a storage change on the bus. Run it before the manager sees
    /// the same event.
    pub fn handle_storage_event(&self, event: &StorageEvent) {
        match event {
            StorageEvent::Deleted { account } => {
                self.status.borrow_mut().remove(account);
                self.channel_counts.borrow_mut().remove(account);
                self.emit(account.path(), SignalKind::Removed);
            }
            StorageEvent::Toggled {
                account,
                enabled: false,
            } => {
                self.set_status(account, ConnectionStatus::Disconnected);
            }
            StorageEvent::Created { .. }
            | StorageEvent::Altered { .. }
            | StorageEvent::Toggled { .. } => {}
        }
    }

    pub fn emit(&self, path: ObjectPath, kind: SignalKind) {
        log::trace!("loopback: signal {} {:?}", path, kind);
        if self.signals.send(BusSignal { path, kind }).is_err() {
            log::trace!("loopback: no signal subscribers");
        }
    }

    fn set_status(&self, account: &AccountId, status: ConnectionStatus) {
        let previous = self
            .status
            .borrow_mut()
            .insert(account.clone(), status)
            .unwrap_or_default();
        if previous == status {
            return;
        }
        log::debug!("loopback: {} {}", account, status.as_str());
        self.emit(
            account.path(),
            SignalKind::PropertiesChanged {
                interface: InterfaceKey::new(iface::ACCOUNT),
                changed: PropertyMap::from([(
                    props::CONNECTION_STATUS.to_owned(),
                    json!(status.as_str()),
                )]),
            },
        );
    }

    fn existing(&self, object: &ObjectPath) -> Result<AccountId, BrokerError> {
        AccountId::from_path(object)
            .filter(|account| self.storage.contains(account))
            .ok_or_else(|| BrokerError::not_found(object.to_string()))
    }

    fn manager_properties(&self) -> PropertyMap {
        let (valid, invalid): (Vec<AccountId>, Vec<AccountId>) = self
            .storage
            .list()
            .into_iter()
            .partition(|account| self.is_valid(account));
        let paths = |ids: Vec<AccountId>| {
            Value::Array(
                ids.iter()
                    .map(|id| Value::String(id.path().to_string()))
                    .collect(),
            )
        };
        PropertyMap::from([
            (props::VALID_ACCOUNTS.to_owned(), paths(valid)),
            (props::INVALID_ACCOUNTS.to_owned(), paths(invalid)),
        ])
    }

    fn account_properties(
        &self,
        account: &AccountId,
        interface: &str,
    ) -> Result<PropertyMap, BrokerError> {
        let stored = |names: &[&str]| self.storage.settings(account, names);
        let map = match interface {
            iface::ACCOUNT => {
                let mut map = stored(CORE_SETTINGS);
                map.entry(props::DISPLAY_NAME.to_owned())
                    .or_insert_with(|| json!(account.as_str()));
                map.insert(
                    props::ENABLED.to_owned(),
                    json!(self.storage.is_enabled(account)),
                );
                map.insert(props::VALID.to_owned(), json!(self.is_valid(account)));
                map.insert(
                    props::PARAMETERS.to_owned(),
                    self.storage
                        .get(account, props::PARAMETERS)
                        .unwrap_or_else(|| json!({})),
                );
                map.insert(
                    props::CONNECTION_STATUS.to_owned(),
                    json!(self.status(account).as_str()),
                );
                map
            }
            iface::ACCOUNT_AVATAR => {
                let mut map = stored(&[props::AVATAR_MIME, props::AVATAR_DATA]);
                map.entry(props::AVATAR_MIME.to_owned()).or_insert_with(|| json!(""));
                map.entry(props::AVATAR_DATA.to_owned()).or_insert_with(|| json!(""));
                map
            }
            iface::ACCOUNT_COMPAT => {
                let mut map = stored(&[props::SECONDARY_VCARD_FIELDS]);
                map.entry(props::SECONDARY_VCARD_FIELDS.to_owned())
                    .or_insert_with(|| json!([]));
                map
            }
            iface::ACCOUNT_CONDITIONS => {
                let mut map = stored(&[props::CONDITIONS]);
                map.entry(props::CONDITIONS.to_owned()).or_insert_with(|| json!({}));
                map
            }
            iface::ACCOUNT_STATS => PropertyMap::from([(
                props::CHANNEL_COUNT.to_owned(),
                json!(self.channel_count(account)),
            )]),
            other => {
                return Err(BrokerError::not_found(format!("{} on {}", other, account)));
            }
        };
        Ok(map)
    }

    fn proceed(&self, object: &ObjectPath) -> Result<Value, BrokerError> {
        let request = self
            .requests
            .borrow_mut()
            .remove(object)
            .ok_or_else(|| BrokerError::not_found(object.to_string()))?;
        let event = if self.channel_types.contains(&request.params.channel_type) {
            let count = {
                let mut counts = self.channel_counts.borrow_mut();
                let count = counts.entry(request.account.clone()).or_insert(0);
                *count += 1;
                *count
            };
            self.emit(
                request.account.path(),
                SignalKind::PropertiesChanged {
                    interface: InterfaceKey::new(iface::ACCOUNT_STATS),
                    changed: PropertyMap::from([(props::CHANNEL_COUNT.to_owned(), json!(count))]),
                },
            );
            RequestEvent::Succeeded
        } else {
            log::debug!(
                "loopback: {} unsupported channel type {}",
                object,
                request.params.channel_type
            );
            RequestEvent::Failed(BrokerError::application(
                "NotCapable",
                format!("unsupported channel type {}", request.params.channel_type),
            ))
        };
        self.emit(object.clone(), SignalKind::Request(event));
        Ok(Value::Null)
    }
}

#[async_trait(?Send)]
impl BusProperties for LoopbackBus {
    async fn get_all(
        &self,
        object: &ObjectPath,
        interface: &InterfaceKey,
    ) -> Result<PropertyMap, BrokerError> {
        if *object == ObjectPath::account_manager() {
            if interface.as_str() != iface::ACCOUNT_MANAGER {
                return Err(BrokerError::not_found(format!("{} on {}", interface, object)));
            }
            return Ok(self.manager_properties());
        }
        if object.is_within(&ObjectPath::channel_request_root()) {
            if interface.as_str() != iface::CHANNEL_REQUEST {
                return Err(BrokerError::not_found(format!("{} on {}", interface, object)));
            }
            let requests = self.requests.borrow();
            let request = requests
                .get(object)
                .ok_or_else(|| BrokerError::not_found(object.to_string()))?;
            return Ok(PropertyMap::from([
                (
                    props::ACCOUNT.to_owned(),
                    json!(request.account.path().to_string()),
                ),
                (
                    props::CHANNEL_TYPE.to_owned(),
                    json!(request.params.channel_type),
                ),
            ]));
        }
        let account = self.existing(object)?;
        self.account_properties(&account, interface.as_str())
    }
}

#[async_trait(?Send)]
impl BusMethods for LoopbackBus {
    async fn call(
        &self,
        object: &ObjectPath,
        method: &str,
        _args: PropertyMap,
    ) -> Result<Value, BrokerError> {
        match method {
            methods::CONNECT => {
                let account = self.existing(object)?;
                if !self.storage.is_enabled(&account) {
                    return Err(BrokerError::application(
                        "Disabled",
                        format!("{} is disabled", account),
                    ));
                }
                self.set_status(&account, ConnectionStatus::Connected);
                Ok(Value::Null)
            }
            methods::DISCONNECT => {
                let account = self.existing(object)?;
                self.set_status(&account, ConnectionStatus::Disconnected);
                Ok(Value::Null)
            }
            methods::PROCEED => self.proceed(object),
            methods::CANCEL => {
                self.requests
                    .borrow_mut()
                    .remove(object)
                    .ok_or_else(|| BrokerError::not_found(object.to_string()))?;
                log::debug!("loopback: {} cancelled", object);
                self.emit(object.clone(), SignalKind::Request(RequestEvent::Cancelled));
                Ok(Value::Null)
            }
            other => Err(BrokerError::not_implemented(other)),
        }
    }

    async fn create_channel(
        &self,
        account: &ObjectPath,
        params: &ChannelRequestParams,
    ) -> Result<ObjectPath, BrokerError> {
        let id = self.existing(account)?;
        if !self.storage.is_enabled(&id) {
            return Err(BrokerError::application(
                "Disabled",
                format!("{} is disabled", id),
            ));
        }
        if params.channel_type.is_empty() {
            return Err(BrokerError::invalid_request("channel type is empty"));
        }
        let serial = self.next_request.get();
        self.next_request.set(serial + 1);
        let path = ObjectPath::channel_request_root().child(&serial.to_string())?;
        log::debug!("loopback: {} created for {}", path, id);
        self.requests.borrow_mut().insert(
            path.clone(),
            PendingRequest {
                account: id,
                params: params.clone(),
            },
        );
        Ok(path)
    }
}

impl BusSignals for LoopbackBus {
    fn subscribe_signals(&self) -> Result<broadcast::Receiver<BusSignal>, BrokerError> {
        Ok(self.signals.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> AccountId {
        AccountId::new(format!("xmpp/jabber/{name}")).expect("id")
    }

    fn bus_with(accounts: &[(&str, bool)]) -> LoopbackBus {
        let storage = Rc::new(StorageRegistry::new());
        for (name, enabled) in accounts {
            storage
                .create_account(
                    &id(name),
                    PropertyMap::from([(props::ENABLED.to_owned(), json!(enabled))]),
                )
                .expect("create");
        }
        LoopbackBus::new(storage)
    }

    #[tokio::test]
    async fn manager_lists_accounts_by_validity() {
        let storage = Rc::new(StorageRegistry::new());
        let alice = id("alice");
        let bob = AccountId::new("irc/irc/bob").expect("id");
        storage.create_account(&alice, PropertyMap::new()).expect("create");
        storage.create_account(&bob, PropertyMap::new()).expect("create");
        let bus = LoopbackBus::new(storage).with_managers(["xmpp"]);

        let map = bus
            .get_all(
                &ObjectPath::account_manager(),
                &InterfaceKey::new(iface::ACCOUNT_MANAGER),
            )
            .await
            .expect("manager props");
        assert_eq!(map[props::VALID_ACCOUNTS], json!([alice.path().to_string()]));
        assert_eq!(map[props::INVALID_ACCOUNTS], json!([bob.path().to_string()]));
    }

    #[tokio::test]
    async fn core_interface_fills_defaults() {
        let bus = bus_with(&[("alice", true)]);
        let map = bus
            .get_all(&id("alice").path(), &InterfaceKey::new(iface::ACCOUNT))
            .await
            .expect("core");
        assert_eq!(map[props::ENABLED], json!(true));
        assert_eq!(map[props::VALID], json!(true));
        assert_eq!(map[props::DISPLAY_NAME], json!("xmpp/jabber/alice"));
        assert_eq!(map[props::CONNECTION_STATUS], json!("disconnected"));
        assert_eq!(map[props::PARAMETERS], json!({}));
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let bus = bus_with(&[]);
        let err = bus
            .get_all(&id("ghost").path(), &InterfaceKey::new(iface::ACCOUNT))
            .await
            .expect_err("missing");
        assert!(matches!(err, BrokerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn connect_refuses_disabled_account() {
        let bus = bus_with(&[("alice", false)]);
        let err = bus
            .call(&id("alice").path(), methods::CONNECT, PropertyMap::new())
            .await
            .expect_err("disabled");
        assert!(matches!(err, BrokerError::Application { .. }));
        assert_eq!(bus.status(&id("alice")), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_emits_status_change() {
        let bus = bus_with(&[("alice", true)]);
        let mut signals = bus.subscribe_signals().expect("subscribe");
        bus.call(&id("alice").path(), methods::CONNECT, PropertyMap::new())
            .await
            .expect("connect");
        assert_eq!(bus.status(&id("alice")), ConnectionStatus::Connected);
        let signal = signals.try_recv().expect("signal");
        assert_eq!(signal.path, id("alice").path());
        assert!(matches!(signal.kind, SignalKind::PropertiesChanged { .. }));

        // Connecting twice changes nothing and says nothing.
        bus.call(&id("alice").path(), methods::CONNECT, PropertyMap::new())
            .await
            .expect("connect again");
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn proceed_reports_outcome_per_channel_type() {
        let bus = bus_with(&[("alice", true)]).with_channel_types([TEXT_CHANNEL]);
        let mut signals = bus.subscribe_signals().expect("subscribe");
        let account = id("alice").path();

        let text = bus
            .create_channel(&account, &ChannelRequestParams::new(TEXT_CHANNEL))
            .await
            .expect("text");
        let call = bus
            .create_channel(&account, &ChannelRequestParams::new(CALL_CHANNEL))
            .await
            .expect("call");
        assert_ne!(text, call);
        assert!(text.is_within(&ObjectPath::channel_request_root()));
        assert_eq!(bus.pending_requests(), 2);

        bus.call(&text, methods::PROCEED, PropertyMap::new())
            .await
            .expect("proceed");
        let stats = signals.try_recv().expect("stats");
        assert_eq!(stats.path, account);
        let done = signals.try_recv().expect("outcome");
        assert_eq!(done.path, text);
        assert_eq!(done.kind, SignalKind::Request(RequestEvent::Succeeded));
        assert_eq!(bus.channel_count(&id("alice")), 1);

        bus.call(&call, methods::PROCEED, PropertyMap::new())
            .await
            .expect("proceed");
        let failed = signals.try_recv().expect("outcome");
        assert!(matches!(
            failed.kind,
            SignalKind::Request(RequestEvent::Failed(BrokerError::Application { .. }))
        ));
        assert_eq!(bus.pending_requests(), 0);
        assert_eq!(bus.channel_count(&id("alice")), 1);
    }

    #[tokio::test]
    async fn cancel_drops_the_pending_request() {
        let bus = bus_with(&[("alice", true)]);
        let mut signals = bus.subscribe_signals().expect("subscribe");
        let request = bus
            .create_channel(&id("alice").path(), &ChannelRequestParams::new(TEXT_CHANNEL))
            .await
            .expect("created");
        assert_eq!(bus.pending_requests(), 1);

        bus.call(&request, methods::CANCEL, PropertyMap::new())
            .await
            .expect("cancel");
        assert_eq!(bus.pending_requests(), 0);
        let signal = signals.try_recv().expect("outcome");
        assert_eq!(signal.path, request);
        assert_eq!(signal.kind, SignalKind::Request(RequestEvent::Cancelled));
        assert!(matches!(
            bus.call(&request, methods::PROCEED, PropertyMap::new()).await,
            Err(BrokerError::NotFound { .. })
        ));
        assert_eq!(bus.channel_count(&id("alice")), 0);
    }

    #[tokio::test]
    async fn create_channel_validates_input() {
        let bus = bus_with(&[("alice", true), ("bob", false)]);
        assert!(matches!(
            bus.create_channel(&id("alice").path(), &ChannelRequestParams::new(""))
                .await,
            Err(BrokerError::InvalidRequest { .. })
        ));
        assert!(matches!(
            bus.create_channel(&id("bob").path(), &ChannelRequestParams::new(TEXT_CHANNEL))
                .await,
            Err(BrokerError::Application { .. })
        ));
        assert!(matches!(
            bus.create_channel(&id("carol").path(), &ChannelRequestParams::new(TEXT_CHANNEL))
                .await,
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[test]
    fn deleted_account_is_removed_from_bus() {
        let bus = bus_with(&[("alice", true)]);
        let mut signals = bus.subscribe_signals().expect("subscribe");
        bus.handle_storage_event(&StorageEvent::Deleted { account: id("alice") });
        let signal = signals.try_recv().expect("removed");
        assert_eq!(signal.path, id("alice").path());
        assert_eq!(signal.kind, SignalKind::Removed);
    }
}
