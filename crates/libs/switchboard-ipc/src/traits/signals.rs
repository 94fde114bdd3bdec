use tokio::sync::broadcast;

use crate::error::BrokerError;
use crate::types::BusSignal;

/// Signal subscriptions via `tokio::sync::broadcast`.
pub trait BusSignals {
    /// Subscribe to every signal on the bus. Filtering by object path is the
    /// subscriber's job.
    fn subscribe_signals(&self) -> Result<broadcast::Receiver<BusSignal>, BrokerError>;
}
