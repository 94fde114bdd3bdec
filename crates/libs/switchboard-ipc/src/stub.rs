use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BrokerError;
use crate::traits::*;
use crate::types::*;

/// A bus implementation that returns `NotImplemented` for every method.
///
/// Useful as a placeholder far end when only local behaviour is under test.
pub struct StubBus;

#[async_trait(?Send)]
impl BusProperties for StubBus {
    async fn get_all(
        &self,
        _object: &ObjectPath,
        _interface: &InterfaceKey,
    ) -> Result<PropertyMap, BrokerError> {
        Err(BrokerError::not_implemented("get_all"))
    }
}

#[async_trait(?Send)]
impl BusMethods for StubBus {
    async fn call(
        &self,
        _object: &ObjectPath,
        method: &str,
        _args: PropertyMap,
    ) -> Result<serde_json::Value, BrokerError> {
        Err(BrokerError::not_implemented(method))
    }

    async fn create_channel(
        &self,
        _account: &ObjectPath,
        _params: &ChannelRequestParams,
    ) -> Result<ObjectPath, BrokerError> {
        Err(BrokerError::not_implemented("create_channel"))
    }
}

impl BusSignals for StubBus {
    fn subscribe_signals(&self) -> Result<broadcast::Receiver<BusSignal>, BrokerError> {
        Err(BrokerError::not_implemented("subscribe_signals"))
    }
}
