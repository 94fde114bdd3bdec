//! Bus boundary for the switchboard account broker.
//!
//! This crate defines what the broker core needs from the message bus it
//! lives on, without committing to a wire encoding. It provides:
//!
//! - **Boundary types**: object paths, interface keys, property maps,
//!   channel request parameters, bus signals, storage events
//! - **Async trait definitions** for the transport collaborator
//! - **`StubBus`** returning `NotImplemented` for every method
//! - **`BrokerError`**, the error taxonomy shared by every layer
//!
//! # Trait hierarchy
//!
//! - [`BusProperties`]: bulk property fetches per interface
//! - [`BusMethods`]: method calls and channel creation
//! - [`BusSignals`]: signal subscriptions via broadcast channels
//! - [`Bus`]: composite (auto-implemented for all three)
//!
//! All traits are `?Send`: the broker runs on a single-threaded event loop.

pub mod error;
pub mod traits;
pub mod types;

pub use error::BrokerError;
pub use traits::{Bus, BusMethods, BusProperties, BusSignals};
pub use types::*;

mod stub;
pub use stub::StubBus;
