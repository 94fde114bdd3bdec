//! Coordination engine of the switchboard broker.
//!
//! Everything here runs on one thread and never blocks. Work that needs the
//! far end is handed to a [`Transport`] together with a [`Reply`]; the
//! transport completes the reply later from the event loop.
//!
//! - [`Proxy`]: per-object readiness with one fetch in flight per key
//! - [`wait_all`] / [`AggregateWait`]: many readiness waits, one callback
//! - [`Mission`] / [`Operation`]: lifecycle tree with cascading transitions
//! - [`RequestTracker`]: in-flight channel requests behind generational handles
//! - [`Target`]: cancellation trigger that callers tie their waits to
//! - [`Inhibitor`]: delay token for orderly teardown

pub mod aggregate;
pub mod arena;
pub mod inhibit;
pub mod mission;
pub mod readiness;
pub mod request;
pub mod target;
pub mod transport;

#[cfg(test)]
mod testing;

pub use aggregate::{wait_all, AggregateWait};
pub use arena::{Arena, Handle};
pub use inhibit::{InhibitGuard, InhibitSlot, Inhibitor};
pub use mission::{ListenerId, Mission, MissionHandler, Operation};
pub use readiness::{Proxy, ReadyCallback, Registration, WaiterId, WeakProxy};
pub use request::{RequestHandle, RequestOutcome, RequestState, RequestTracker};
pub use target::{Target, WatchGuard, WeakTarget};
pub use transport::{BusTransport, Reply, SignalSink, Subscription, Transport};
