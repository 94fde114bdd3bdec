mod methods;
mod properties;
mod signals;

pub use methods::BusMethods;
pub use properties::BusProperties;
pub use signals::BusSignals;

/// Composite trait encompassing everything the broker needs from its bus.
///
/// Automatically implemented for any type that implements all three
/// sub-traits. Use `Rc<dyn Bus>` as the primary handle type.
pub trait Bus: BusProperties + BusMethods + BusSignals {}

impl<T> Bus for T where T: BusProperties + BusMethods + BusSignals {}
