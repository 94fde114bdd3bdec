//! Account storage plugins and the registry that consults them in priority
//! order.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde_json::Value;
use switchboard_ipc::{props, AccountId, PropertyMap, StorageEvent};
use tokio::sync::broadcast;

use crate::config::{AccountConfig, DaemonConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("account {0} already exists")]
    AlreadyExists(AccountId),

    #[error("no storage plugin named {0}")]
    UnknownPlugin(String),

    #[error("storage({plugin}): {message}")]
    Backend { plugin: String, message: String },
}

/// A source of account settings.
///
/// Settings are keyed by account and setting name. Implementations use
/// interior mutability: the registry shares them behind `Rc`.
pub trait AccountStorage {
    fn name(&self) -> &str;

    /// Higher priorities are consulted first.
    fn priority(&self) -> i32;

    fn owns(&self, account: &AccountId) -> bool;

    fn get(&self, account: &AccountId, setting: &str) -> Option<Value>;

    /// Store `value`, creating the account if this plugin does not hold it yet.
    fn set(&self, account: &AccountId, setting: &str, value: Value) -> Result<(), StorageError>;

    /// Delete one setting, or the whole account when `setting` is `None`.
    /// Returns `false` if there was nothing to delete.
    fn delete(&self, account: &AccountId, setting: Option<&str>) -> Result<bool, StorageError>;

    /// Persist pending changes of `account`, or of every account.
    fn commit(&self, account: Option<&AccountId>) -> Result<(), StorageError>;

    fn list(&self) -> Vec<AccountId>;
}

type Settings = BTreeMap<String, Value>;

/// In-memory plugin. Changes stay dirty until committed.
#[derive(Debug)]
pub struct MemoryStorage {
    name: String,
    priority: i32,
    live: RefCell<BTreeMap<AccountId, Settings>>,
    committed: RefCell<BTreeMap<AccountId, Settings>>,
    dirty: RefCell<BTreeSet<AccountId>>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            live: RefCell::new(BTreeMap::new()),
            committed: RefCell::new(BTreeMap::new()),
            dirty: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn is_dirty(&self, account: &AccountId) -> bool {
        self.dirty.borrow().contains(account)
    }

    /// The last committed value of `setting`.
    pub fn committed(&self, account: &AccountId, setting: &str) -> Option<Value> {
        self.committed
            .borrow()
            .get(account)
            .and_then(|settings| settings.get(setting))
            .cloned()
    }

    fn commit_one(&self, account: &AccountId) {
        let live = self.live.borrow().get(account).cloned();
        let mut committed = self.committed.borrow_mut();
        match live {
            Some(settings) => {
                committed.insert(account.clone(), settings);
            }
            None => {
                committed.remove(account);
            }
        }
    }
}

impl AccountStorage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn owns(&self, account: &AccountId) -> bool {
        self.live.borrow().contains_key(account)
    }

    fn get(&self, account: &AccountId, setting: &str) -> Option<Value> {
        self.live
            .borrow()
            .get(account)
            .and_then(|settings| settings.get(setting))
            .cloned()
    }

    fn set(&self, account: &AccountId, setting: &str, value: Value) -> Result<(), StorageError> {
        self.live
            .borrow_mut()
            .entry(account.clone())
            .or_default()
            .insert(setting.to_owned(), value);
        self.dirty.borrow_mut().insert(account.clone());
        Ok(())
    }

    fn delete(&self, account: &AccountId, setting: Option<&str>) -> Result<bool, StorageError> {
        let removed = {
            let mut live = self.live.borrow_mut();
            match setting {
                None => live.remove(account).is_some(),
                Some(setting) => live
                    .get_mut(account)
                    .is_some_and(|settings| settings.remove(setting).is_some()),
            }
        };
        if removed {
            self.dirty.borrow_mut().insert(account.clone());
        }
        Ok(removed)
    }

    fn commit(&self, account: Option<&AccountId>) -> Result<(), StorageError> {
        let accounts: Vec<AccountId> = match account {
            Some(account) => {
                if !self.dirty.borrow_mut().remove(account) {
                    return Ok(());
                }
                vec![account.clone()]
            }
            None => std::mem::take(&mut *self.dirty.borrow_mut())
                .into_iter()
                .collect(),
        };
        for account in &accounts {
            self.commit_one(account);
        }
        log::trace!("storage({}): committed {} accounts", self.name, accounts.len());
        Ok(())
    }

    fn list(&self) -> Vec<AccountId> {
        self.live.borrow().keys().cloned().collect()
    }
}

/// Plugins in descending priority, plus the storage event channel.
pub struct StorageRegistry {
    plugins: RefCell<Vec<Rc<dyn AccountStorage>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRegistry {
    /// A registry holding only the `default` in-memory plugin at priority 0.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.add_plugin(Rc::new(MemoryStorage::new("default", 0)));
        registry
    }

    pub fn empty() -> Self {
        Self {
            plugins: RefCell::new(Vec::new()),
            events: broadcast::channel(64).0,
        }
    }

    /// Build the plugins named in `config` and seed its accounts.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, StorageError> {
        let registry = Self::new();
        for storage in &config.storage {
            registry.add_plugin(Rc::new(MemoryStorage::new(
                storage.name.clone(),
                storage.priority,
            )));
        }
        for account in &config.accounts {
            let id = account
                .account_id()
                .map_err(|err| StorageError::Backend {
                    plugin: "config".into(),
                    message: err.to_string(),
                })?;
            let plugin = match &account.storage {
                Some(name) => registry
                    .plugin(name)
                    .ok_or_else(|| StorageError::UnknownPlugin(name.clone()))?,
                None => registry
                    .highest()
                    .ok_or_else(|| StorageError::UnknownPlugin("default".into()))?,
            };
            if registry.owner(&id).is_some() {
                return Err(StorageError::AlreadyExists(id));
            }
            for (setting, value) in seed_settings(account) {
                plugin.set(&id, &setting, value)?;
            }
            plugin.commit(Some(&id))?;
            log::debug!("storage({}): seeded {}", plugin.name(), id);
        }
        Ok(registry)
    }

    pub fn add_plugin(&self, plugin: Rc<dyn AccountStorage>) {
        let mut plugins = self.plugins.borrow_mut();
        let index = plugins
            .iter()
            .position(|existing| existing.priority() < plugin.priority())
            .unwrap_or(plugins.len());
        log::debug!("storage({}): registered at priority {}", plugin.name(), plugin.priority());
        plugins.insert(index, plugin);
    }

    pub fn plugin(&self, name: &str) -> Option<Rc<dyn AccountStorage>> {
        self.plugins
            .borrow()
            .iter()
            .find(|plugin| plugin.name() == name)
            .cloned()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .borrow()
            .iter()
            .map(|plugin| plugin.name().to_owned())
            .collect()
    }

    fn highest(&self) -> Option<Rc<dyn AccountStorage>> {
        self.plugins.borrow().first().cloned()
    }

    /// The highest priority plugin holding `account`.
    pub fn owner(&self, account: &AccountId) -> Option<Rc<dyn AccountStorage>> {
        self.plugins
            .borrow()
            .iter()
            .find(|plugin| plugin.owns(account))
            .cloned()
    }

    pub fn contains(&self, account: &AccountId) -> bool {
        self.owner(account).is_some()
    }

    /// First hit in priority order.
    pub fn get(&self, account: &AccountId, setting: &str) -> Option<Value> {
        let plugins: Vec<_> = self.plugins.borrow().clone();
        plugins.iter().find_map(|plugin| plugin.get(account, setting))
    }

    pub fn set(
        &self,
        account: &AccountId,
        setting: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let plugin = self
            .owner(account)
            .ok_or_else(|| StorageError::NotFound(account.clone()))?;
        plugin.set(account, setting, value)?;
        self.publish(StorageEvent::Altered {
            account: account.clone(),
            setting: setting.to_owned(),
        });
        Ok(())
    }

    pub fn delete(&self, account: &AccountId, setting: &str) -> Result<bool, StorageError> {
        let plugin = self
            .owner(account)
            .ok_or_else(|| StorageError::NotFound(account.clone()))?;
        let removed = plugin.delete(account, Some(setting))?;
        if removed {
            self.publish(StorageEvent::Altered {
                account: account.clone(),
                setting: setting.to_owned(),
            });
        }
        Ok(removed)
    }

    pub fn commit(&self, account: Option<&AccountId>) -> Result<(), StorageError> {
        match account {
            Some(account) => match self.owner(account) {
                Some(plugin) => plugin.commit(Some(account)),
                None => Err(StorageError::NotFound(account.clone())),
            },
            None => {
                let plugins: Vec<_> = self.plugins.borrow().clone();
                plugins.iter().try_for_each(|plugin| plugin.commit(None))
            }
        }
    }

    /// Every account held by any plugin, once.
    pub fn list(&self) -> Vec<AccountId> {
        let plugins: Vec<_> = self.plugins.borrow().clone();
        plugins
            .iter()
            .flat_map(|plugin| plugin.list())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every stored setting of `account`, resolved in priority order.
    pub fn settings(&self, account: &AccountId, names: &[&str]) -> PropertyMap {
        names
            .iter()
            .filter_map(|name| self.get(account, name).map(|value| ((*name).to_owned(), value)))
            .collect()
    }

    /// Create `account` in the highest priority plugin.
    pub fn create_account(
        &self,
        account: &AccountId,
        settings: PropertyMap,
    ) -> Result<(), StorageError> {
        if self.contains(account) {
            return Err(StorageError::AlreadyExists(account.clone()));
        }
        let plugin = self
            .highest()
            .ok_or_else(|| StorageError::UnknownPlugin("default".into()))?;
        for (setting, value) in settings {
            plugin.set(account, &setting, value)?;
        }
        if !plugin.owns(account) {
            plugin.set(account, props::ENABLED, Value::Bool(false))?;
        }
        plugin.commit(Some(account))?;
        log::info!("storage({}): created {}", plugin.name(), account);
        self.publish(StorageEvent::Created {
            account: account.clone(),
        });
        Ok(())
    }

    pub fn delete_account(&self, account: &AccountId) -> Result<(), StorageError> {
        let plugin = self
            .owner(account)
            .ok_or_else(|| StorageError::NotFound(account.clone()))?;
        plugin.delete(account, None)?;
        plugin.commit(Some(account))?;
        log::info!("storage({}): deleted {}", plugin.name(), account);
        self.publish(StorageEvent::Deleted {
            account: account.clone(),
        });
        Ok(())
    }

    pub fn set_enabled(&self, account: &AccountId, enabled: bool) -> Result<(), StorageError> {
        let plugin = self
            .owner(account)
            .ok_or_else(|| StorageError::NotFound(account.clone()))?;
        plugin.set(account, props::ENABLED, Value::Bool(enabled))?;
        plugin.commit(Some(account))?;
        self.publish(StorageEvent::Toggled {
            account: account.clone(),
            enabled,
        });
        Ok(())
    }

    pub fn is_enabled(&self, account: &AccountId) -> bool {
        self.get(account, props::ENABLED)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Sender for out-of-band events raised by plugins.
    pub fn events(&self) -> broadcast::Sender<StorageEvent> {
        self.events.clone()
    }

    pub fn publish(&self, event: StorageEvent) {
        log::debug!("storage: {:?}", event);
        if self.events.send(event).is_err() {
            log::trace!("storage: no event subscribers");
        }
    }
}

fn seed_settings(account: &AccountConfig) -> PropertyMap {
    let mut settings = PropertyMap::new();
    settings.insert(props::ENABLED.into(), Value::Bool(account.enabled));
    settings.insert(
        props::PARAMETERS.into(),
        Value::Object(account.parameters.clone().into_iter().collect()),
    );
    let optional = [
        (props::DISPLAY_NAME, &account.display_name),
        (props::NICKNAME, &account.nickname),
        (props::ICON, &account.icon),
        (props::AVATAR_MIME, &account.avatar_mime),
        (props::AVATAR_DATA, &account.avatar_data),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            settings.insert(name.into(), Value::String(value.clone()));
        }
    }
    if !account.conditions.is_empty() {
        settings.insert(
            props::CONDITIONS.into(),
            serde_json::to_value(&account.conditions).unwrap_or(Value::Null),
        );
    }
    if !account.secondary_vcard_fields.is_empty() {
        settings.insert(
            props::SECONDARY_VCARD_FIELDS.into(),
            serde_json::to_value(&account.secondary_vcard_fields).unwrap_or(Value::Null),
        );
    }
    settings
}
