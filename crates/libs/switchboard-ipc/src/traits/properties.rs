use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{InterfaceKey, ObjectPath, PropertyMap};

/// Bulk property access.
#[async_trait(?Send)]
pub trait BusProperties {
    /// Fetch every property of `interface` on `object` in one round trip.
    async fn get_all(
        &self,
        object: &ObjectPath,
        interface: &InterfaceKey,
    ) -> Result<PropertyMap, BrokerError>;
}
