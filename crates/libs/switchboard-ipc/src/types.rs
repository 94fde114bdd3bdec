use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

// ── Well-known names ──────────────────────────────────────────────────────────

/// Interface names served by account objects and the account manager.
pub mod iface {
    pub const ACCOUNT_MANAGER: &str = "im.switchboard.AccountManager";
    pub const ACCOUNT: &str = "im.switchboard.Account";
    pub const ACCOUNT_AVATAR: &str = "im.switchboard.Account.Avatar";
    pub const ACCOUNT_COMPAT: &str = "im.switchboard.Account.Compat";
    pub const ACCOUNT_CONDITIONS: &str = "im.switchboard.Account.Conditions";
    pub const ACCOUNT_STATS: &str = "im.switchboard.Account.Stats";
    pub const CHANNEL_REQUEST: &str = "im.switchboard.ChannelRequest";
}

/// Object paths of the broker's fixed objects.
pub mod paths {
    pub const ACCOUNT_MANAGER: &str = "/im/switchboard/AccountManager";
    pub const ACCOUNT_ROOT: &str = "/im/switchboard/Account";
    pub const CHANNEL_REQUEST_ROOT: &str = "/im/switchboard/ChannelRequest";
}

/// Method names understood by account and channel request objects.
pub mod methods {
    pub const CONNECT: &str = "Connect";
    pub const DISCONNECT: &str = "Disconnect";
    pub const PROCEED: &str = "Proceed";
    pub const CANCEL: &str = "Cancel";
}

/// Property names. Stored account settings use the same names.
pub mod props {
    pub const VALID_ACCOUNTS: &str = "ValidAccounts";
    pub const INVALID_ACCOUNTS: &str = "InvalidAccounts";

    pub const DISPLAY_NAME: &str = "DisplayName";
    pub const ENABLED: &str = "Enabled";
    pub const VALID: &str = "Valid";
    pub const NICKNAME: &str = "Nickname";
    pub const ICON: &str = "Icon";
    pub const PARAMETERS: &str = "Parameters";
    pub const CONNECTION_STATUS: &str = "ConnectionStatus";

    pub const AVATAR_MIME: &str = "AvatarMime";
    pub const AVATAR_DATA: &str = "AvatarData";
    pub const SECONDARY_VCARD_FIELDS: &str = "SecondaryVCardFields";
    pub const CONDITIONS: &str = "Conditions";
    pub const CHANNEL_COUNT: &str = "ChannelCount";

    pub const ACCOUNT: &str = "Account";
    pub const CHANNEL_TYPE: &str = "ChannelType";
}

// ── Property values ───────────────────────────────────────────────────────────

/// Property name → value, as returned by a bulk fetch of one interface.
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

// ── Object paths ──────────────────────────────────────────────────────────────

/// A validated bus object path: `/` or `/seg/seg...` with `[A-Za-z0-9_]` segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self, BrokerError> {
        let path = path.into();
        if path == "/" {
            return Ok(Self(path));
        }
        let Some(rest) = path.strip_prefix('/') else {
            return Err(BrokerError::invalid_request(format!(
                "object path must start with '/': {path}"
            )));
        };
        if rest.split('/').any(|segment| !is_valid_segment(segment)) {
            return Err(BrokerError::invalid_request(format!("invalid object path: {path}")));
        }
        Ok(Self(path))
    }

    pub fn account_manager() -> Self {
        Self(paths::ACCOUNT_MANAGER.to_owned())
    }

    pub fn channel_request_root() -> Self {
        Self(paths::CHANNEL_REQUEST_ROOT.to_owned())
    }

    /// Appends one segment. Fails if `segment` is not a valid path element.
    pub fn child(&self, segment: &str) -> Result<Self, BrokerError> {
        if !is_valid_segment(segment) {
            return Err(BrokerError::invalid_request(format!(
                "invalid object path segment: {segment}"
            )));
        }
        if self.0 == "/" {
            Ok(Self(format!("/{segment}")))
        } else {
            Ok(Self(format!("{}/{segment}", self.0)))
        }
    }

    /// `true` if `self` equals `root` or lies below it.
    pub fn is_within(&self, root: &ObjectPath) -> bool {
        if root.0 == "/" || self.0 == root.0 {
            return true;
        }
        self.0
            .strip_prefix(root.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectPath> for String {
    fn from(value: ObjectPath) -> Self {
        value.0
    }
}

// ── Interface keys ────────────────────────────────────────────────────────────

/// Interface identifier used as the readiness key on a proxy.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceKey(String);

impl InterfaceKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InterfaceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ── Accounts ──────────────────────────────────────────────────────────────────

/// `manager/protocol/name` account identifier, e.g. `xmpp/jabber/alice0`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Result<Self, BrokerError> {
        let id = id.into();
        let segments: Vec<&str> = id.split('/').collect();
        if segments.len() != 3 || segments.iter().any(|segment| !is_valid_segment(segment)) {
            return Err(BrokerError::invalid_request(format!(
                "account id must be manager/protocol/name: {id}"
            )));
        }
        Ok(Self(id))
    }

    pub fn path(&self) -> ObjectPath {
        ObjectPath(format!("{}/{}", paths::ACCOUNT_ROOT, self.0))
    }

    /// Inverse of [`AccountId::path`].
    pub fn from_path(path: &ObjectPath) -> Option<Self> {
        let rest = path.as_str().strip_prefix(paths::ACCOUNT_ROOT)?.strip_prefix('/')?;
        Self::new(rest).ok()
    }

    pub fn manager(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn protocol(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccountId {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

// ── Channel requests ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct ChannelRequestParams {
    pub channel_type: String,
    pub target_id: Option<String>,
    pub user_action_time: i64,
    pub preferred_handler: Option<String>,
    pub properties: PropertyMap,
}

impl ChannelRequestParams {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_preferred_handler(mut self, handler: impl Into<String>) -> Self {
        self.preferred_handler = Some(handler.into());
        self
    }
}

/// Terminal outcome reported by the far end for a channel request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RequestEvent {
    Succeeded,
    Failed(BrokerError),
    Cancelled,
}

// ── Signals ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BusSignal {
    pub path: ObjectPath,
    pub kind: SignalKind,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SignalKind {
    PropertiesChanged {
        interface: InterfaceKey,
        changed: PropertyMap,
    },
    /// The object is gone from the bus.
    Removed,
    Request(RequestEvent),
}

// ── Storage events ────────────────────────────────────────────────────────────

/// Out-of-band change notifications from account storage plugins.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StorageEvent {
    Created { account: AccountId },
    Altered { account: AccountId, setting: String },
    Toggled { account: AccountId, enabled: bool },
    Deleted { account: AccountId },
}

impl StorageEvent {
    pub fn account(&self) -> &AccountId {
        match self {
            Self::Created { account }
            | Self::Altered { account, .. }
            | Self::Toggled { account, .. }
            | Self::Deleted { account } => account,
        }
    }
}
