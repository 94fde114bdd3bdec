//! Account domain of the switchboard broker.
//!
//! Accounts, the account manager that roots the mission tree, account
//! storage plugins, the connectivity monitor, and an in-process loopback bus
//! that serves all of them.

pub mod account;
pub mod config;
pub mod connectivity;
pub mod loopback;
pub mod manager;
pub mod storage;

pub use account::{Account, AccountFeature, Avatar};
pub use config::{ConfigError, DaemonConfig};
pub use connectivity::ConnectivityMonitor;
pub use loopback::LoopbackBus;
pub use manager::{pump_storage_events, AccountManager};
pub use storage::{AccountStorage, MemoryStorage, StorageError, StorageRegistry};
