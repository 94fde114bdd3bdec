//! Callback-level transport contract and its adapter over an async [`Bus`].
//!
//! The core never awaits. It hands the transport a [`Reply`] and returns to
//! the event loop; the transport completes the reply when the far end
//! answers. [`BusTransport`] does that by spawning a local task per call, so
//! it must be used from inside a `tokio::task::LocalSet`.

use std::fmt;
use std::rc::Rc;

use switchboard_ipc::{
    Bus, BrokerError, BusSignal, ChannelRequestParams, InterfaceKey, ObjectPath, PropertyMap,
};
use tokio::sync::broadcast::error::RecvError;

/// One-shot completion handed to the transport.
///
/// Dropping a reply without completing it delivers a transport error, so a
/// lost reply can never strand its waiters.
pub struct Reply<T> {
    what: &'static str,
    complete: Option<Box<dyn FnOnce(Result<T, BrokerError>)>>,
}

impl<T> Reply<T> {
    pub fn new(
        what: &'static str,
        complete: impl FnOnce(Result<T, BrokerError>) + 'static,
    ) -> Self {
        Self {
            what,
            complete: Some(Box::new(complete)),
        }
    }

    pub fn complete(mut self, result: Result<T, BrokerError>) {
        if let Some(complete) = self.complete.take() {
            complete(result);
        }
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("what", &self.what)
            .field("pending", &self.complete.is_some())
            .finish()
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            log::debug!("transport: {} reply dropped without completion", self.what);
            complete(Err(BrokerError::transport(format!(
                "{} reply dropped",
                self.what
            ))));
        }
    }
}

/// Receives every signal emitted at or below a subscription root.
pub type SignalSink = Rc<dyn Fn(&BusSignal)>;

/// Active signal subscription; delivery stops when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// What the core needs from the bus, expressed as callbacks.
///
/// Implementations must not complete a reply synchronously while holding any
/// state the completion could reenter; completing from inside `issue_*` is
/// otherwise allowed.
pub trait Transport {
    fn issue_fetch(&self, object: &ObjectPath, key: &InterfaceKey, reply: Reply<PropertyMap>);

    fn issue_request(
        &self,
        owner: &ObjectPath,
        params: &ChannelRequestParams,
        reply: Reply<ObjectPath>,
    );

    fn issue_call(
        &self,
        object: &ObjectPath,
        method: &str,
        args: PropertyMap,
        reply: Reply<serde_json::Value>,
    );

    fn subscribe(&self, root: &ObjectPath, sink: SignalSink) -> Subscription;
}

/// [`Transport`] over an async [`Bus`], driven by `spawn_local`.
pub struct BusTransport<B: ?Sized> {
    bus: Rc<B>,
}

impl<B: Bus + ?Sized + 'static> BusTransport<B> {
    pub fn new(bus: Rc<B>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Rc<B> {
        &self.bus
    }
}

impl<B: Bus + ?Sized + 'static> Transport for BusTransport<B> {
    fn issue_fetch(&self, object: &ObjectPath, key: &InterfaceKey, reply: Reply<PropertyMap>) {
        let bus = self.bus.clone();
        let object = object.clone();
        let key = key.clone();
        log::trace!("transport: get_all {} {}", object, key);
        tokio::task::spawn_local(async move {
            let result = bus.get_all(&object, &key).await;
            reply.complete(result);
        });
    }

    fn issue_request(
        &self,
        owner: &ObjectPath,
        params: &ChannelRequestParams,
        reply: Reply<ObjectPath>,
    ) {
        let bus = self.bus.clone();
        let owner = owner.clone();
        let params = params.clone();
        log::trace!("transport: create_channel {} type={}", owner, params.channel_type);
        tokio::task::spawn_local(async move {
            let result = bus.create_channel(&owner, &params).await;
            reply.complete(result);
        });
    }

    fn issue_call(
        &self,
        object: &ObjectPath,
        method: &str,
        args: PropertyMap,
        reply: Reply<serde_json::Value>,
    ) {
        let bus = self.bus.clone();
        let object = object.clone();
        let method = method.to_owned();
        log::trace!("transport: call {} {}", object, method);
        tokio::task::spawn_local(async move {
            let result = bus.call(&object, &method, args).await;
            reply.complete(result);
        });
    }

    fn subscribe(&self, root: &ObjectPath, sink: SignalSink) -> Subscription {
        let mut rx = match self.bus.subscribe_signals() {
            Ok(rx) => rx,
            Err(err) => {
                log::warn!("transport: subscribe {} failed: {}", root, err);
                return Subscription::detached();
            }
        };
        let root = root.clone();
        let handle = tokio::task::spawn_local(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        if signal.path.is_within(&root) {
                            sink(&signal);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "transport: subscriber {} lagged, {} signals lost",
                            root,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(move || handle.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use switchboard_ipc::{SignalKind, StubBus};

    #[test]
    fn dropped_reply_reports_transport_error() {
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let reply: Reply<u32> = Reply::new("probe", move |result| *s.borrow_mut() = Some(result));
        drop(reply);
        let result = seen.borrow_mut().take().expect("completed on drop");
        assert!(matches!(result, Err(BrokerError::Transport { .. })));
    }

    #[test]
    fn completed_reply_fires_once() {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let reply: Reply<u32> = Reply::new("probe", move |_| *c.borrow_mut() += 1);
        reply.complete(Ok(7));
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn subscription_runs_cancel_on_drop() {
        let cancelled = Rc::new(RefCell::new(false));
        let c = cancelled.clone();
        let subscription = Subscription::new(move || *c.borrow_mut() = true);
        drop(subscription);
        assert!(*cancelled.borrow());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bus_transport_delivers_stub_errors() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let transport = BusTransport::new(Rc::new(StubBus));
                let (tx, rx) = tokio::sync::oneshot::channel();
                transport.issue_fetch(
                    &ObjectPath::account_manager(),
                    &InterfaceKey::new("im.switchboard.AccountManager"),
                    Reply::new("fetch", move |result| {
                        let _ = tx.send(result);
                    }),
                );
                let result = rx.await.expect("reply delivered");
                assert!(matches!(result, Err(BrokerError::NotImplemented { .. })));

                let sink: SignalSink = Rc::new(|_signal: &BusSignal| {});
                let subscription = transport.subscribe(&ObjectPath::account_manager(), sink);
                drop(subscription);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bus_transport_filters_signals_by_root() {
        use echo::EchoBus;

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let bus = Rc::new(EchoBus::new());
                let transport = BusTransport::new(bus.clone());
                let seen = Rc::new(RefCell::new(Vec::new()));
                let s = seen.clone();
                let sink: SignalSink =
                    Rc::new(move |signal: &BusSignal| s.borrow_mut().push(signal.path.clone()));
                let _subscription = transport.subscribe(&ObjectPath::channel_request_root(), sink);

                let inside = ObjectPath::channel_request_root().child("1").expect("path");
                bus.emit(ObjectPath::account_manager(), SignalKind::Removed);
                bus.emit(inside.clone(), SignalKind::Removed);
                for _ in 0..4 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(*seen.borrow(), vec![inside]);
            })
            .await;
    }

    /// Minimal bus whose only capability is broadcasting signals.
    mod echo {
        use super::*;
        use switchboard_ipc::{BusMethods, BusProperties, BusSignals};
        use tokio::sync::broadcast;

        pub(super) struct EchoBus {
            tx: broadcast::Sender<BusSignal>,
        }

        impl EchoBus {
            pub(super) fn new() -> Self {
                Self {
                    tx: broadcast::channel(16).0,
                }
            }

            pub(super) fn emit(&self, path: ObjectPath, kind: SignalKind) {
                let _ = self.tx.send(BusSignal { path, kind });
            }
        }

        #[async_trait::async_trait(?Send)]
        impl BusProperties for EchoBus {
            async fn get_all(
                &self,
                _object: &ObjectPath,
                _interface: &InterfaceKey,
            ) -> Result<PropertyMap, BrokerError> {
                Ok(PropertyMap::new())
            }
        }

        #[async_trait::async_trait(?Send)]
        impl BusMethods for EchoBus {
            async fn call(
                &self,
                _object: &ObjectPath,
                _method: &str,
                _args: PropertyMap,
            ) -> Result<serde_json::Value, BrokerError> {
                Ok(serde_json::Value::Null)
            }

            async fn create_channel(
                &self,
                _account: &ObjectPath,
                _params: &ChannelRequestParams,
            ) -> Result<ObjectPath, BrokerError> {
                Err(BrokerError::not_implemented("create_channel"))
            }
        }

        impl BusSignals for EchoBus {
            fn subscribe_signals(&self) -> Result<broadcast::Receiver<BusSignal>, BrokerError> {
                Ok(self.tx.subscribe())
            }
        }
    }
}
