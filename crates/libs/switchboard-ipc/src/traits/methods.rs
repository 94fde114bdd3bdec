use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{ChannelRequestParams, ObjectPath, PropertyMap};

/// Method calls on remote objects.
#[async_trait(?Send)]
pub trait BusMethods {
    /// Invoke `method` on `object` with named arguments.
    async fn call(
        &self,
        object: &ObjectPath,
        method: &str,
        args: PropertyMap,
    ) -> Result<serde_json::Value, BrokerError>;

    /// Ask the far end to create a channel request object for `account`.
    /// Returns the request's object path; the outcome arrives later as a
    /// `SignalKind::Request` signal on that path.
    async fn create_channel(
        &self,
        account: &ObjectPath,
        params: &ChannelRequestParams,
    ) -> Result<ObjectPath, BrokerError>;
}
