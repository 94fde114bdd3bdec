use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use switchboard_ipc::{AccountId, PropertyMap};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
}

#[derive(Debug, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_inhibit_timeout_ms")]
    pub inhibit_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub start_online: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            inhibit_timeout_ms: default_inhibit_timeout_ms(),
            start_online: true,
        }
    }
}

/// One account to seed into storage at startup.
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    /// Last segment of the account id.
    pub id: String,
    pub manager: String,
    pub protocol: String,
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub nickname: Option<String>,
    pub icon: Option<String>,
    pub avatar_mime: Option<String>,
    pub avatar_data: Option<String>,
    #[serde(default)]
    pub parameters: PropertyMap,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    #[serde(default)]
    pub secondary_vcard_fields: Vec<String>,
    /// Storage plugin to create the account in; the highest priority one
    /// when unset.
    pub storage: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_inhibit_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn inhibit_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon.inhibit_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for account in &self.accounts {
            let id = account.account_id()?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::invalid(format!("duplicate account {id}")));
            }
            if let Some(storage) = &account.storage {
                if storage != "default" && !self.storage.iter().any(|s| &s.name == storage) {
                    return Err(ConfigError::invalid(format!(
                        "account {id} names unknown storage {storage}"
                    )));
                }
            }
        }
        let mut names = BTreeSet::from(["default"]);
        for storage in &self.storage {
            if !names.insert(storage.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate storage {}",
                    storage.name
                )));
            }
        }
        Ok(())
    }
}

impl AccountConfig {
    pub fn account_id(&self) -> Result<AccountId, ConfigError> {
        AccountId::new(format!("{}/{}/{}", self.manager, self.protocol, self.id))
            .map_err(|err| ConfigError::invalid(err.to_string()))
    }
}
