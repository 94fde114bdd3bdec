//! Per-object readiness tracking.
//!
//! A [`Proxy`] is the local handle of one remote object. For each interface
//! key it either holds a cached property map (ready), a pending
//! readiness entry with the waiters queued behind the single outstanding
//! fetch, or nothing at all.
//!
//! Delivery never holds a borrow of proxy state while user code runs, so a
//! callback may register again, invalidate the proxy, or release a
//! [`Target`](crate::target::Target) whose waiter is queued behind it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use switchboard_ipc::{BrokerError, BusSignal, InterfaceKey, ObjectPath, PropertyMap, SignalKind};

use crate::target::{WatchGuard, WeakTarget};
use crate::transport::{Reply, SignalSink, Subscription, Transport};

/// Invoked once when a key becomes ready, fails, or the proxy dies.
pub type ReadyCallback = Box<dyn FnOnce(Result<(), BrokerError>)>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WaiterId {
    key: InterfaceKey,
    seq: u64,
}

impl WaiterId {
    pub fn key(&self) -> &InterfaceKey {
        &self.key
    }
}

/// Result of [`Proxy::register_waiter`].
#[derive(Debug)]
pub struct Registration {
    /// This call sent the underlying fetch.
    pub triggered_fetch: bool,
    /// Set while the waiter is queued; `None` if the callback already ran or
    /// was released.
    pub waiter: Option<WaiterId>,
}

struct Waiter {
    seq: u64,
    callback: Option<ReadyCallback>,
    target: Option<WeakTarget>,
    guard: Option<WatchGuard>,
}

impl Waiter {
    fn is_cancelled(&self) -> bool {
        self.callback.is_none()
    }

    fn deliver(mut self, outcome: Result<(), BrokerError>) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        if self.target.as_ref().map_or(true, WeakTarget::is_alive) {
            callback(outcome);
        }
    }
}

struct ReadinessEntry {
    waiters: Vec<Waiter>,
    fetch_issued: bool,
    epoch: u64,
    /// Refreshed while the fetch was in flight; its reply is not trusted.
    stale: bool,
}

#[derive(Default)]
struct ProxyState {
    cache: HashMap<InterfaceKey, PropertyMap>,
    pending: HashMap<InterfaceKey, ReadinessEntry>,
    invalidated: Option<BrokerError>,
    next_seq: u64,
    next_epoch: u64,
}

impl ProxyState {
    fn is_ready(&self, key: &InterfaceKey) -> bool {
        self.cache.contains_key(key) && !self.pending.contains_key(key)
    }
}

struct ProxyInner {
    path: ObjectPath,
    transport: Rc<dyn Transport>,
    state: RefCell<ProxyState>,
    subscription: RefCell<Option<Subscription>>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let pending = std::mem::take(&mut self.state.get_mut().pending);
        if pending.is_empty() {
            return;
        }
        log::debug!("ready({}): released with {} pending keys", self.path, pending.len());
        let error = BrokerError::invalidated("proxy released");
        for (_, entry) in pending {
            for waiter in entry.waiters {
                waiter.deliver(Err(error.clone()));
            }
        }
    }
}

/// Local handle of a remote object; cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Rc<ProxyInner>,
}

impl Proxy {
    /// Create a proxy and subscribe to its own signals.
    pub fn new(path: ObjectPath, transport: Rc<dyn Transport>) -> Self {
        let inner = Rc::new(ProxyInner {
            path,
            transport,
            state: RefCell::new(ProxyState::default()),
            subscription: RefCell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let sink: SignalSink = Rc::new(move |signal: &BusSignal| {
            if let Some(inner) = weak.upgrade() {
                if signal.path == inner.path {
                    Proxy { inner }.handle_signal(signal);
                }
            }
        });
        let subscription = inner.transport.subscribe(&inner.path, sink);
        *inner.subscription.borrow_mut() = Some(subscription);
        Self { inner }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.inner.path
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.inner.transport
    }

    pub fn downgrade(&self) -> WeakProxy {
        WeakProxy {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn is_ready(&self, key: &InterfaceKey) -> bool {
        self.inner.state.borrow().is_ready(key)
    }

    pub fn invalidation(&self) -> Option<BrokerError> {
        self.inner.state.borrow().invalidated.clone()
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.state.borrow().invalidated.is_some()
    }

    /// Number of live (non-cancelled) waiters queued on `key`.
    pub fn pending_waiters(&self, key: &InterfaceKey) -> usize {
        self.inner
            .state
            .borrow()
            .pending
            .get(key)
            .map_or(0, |entry| entry.waiters.iter().filter(|w| !w.is_cancelled()).count())
    }

    pub fn is_fetching(&self, key: &InterfaceKey) -> bool {
        self.inner
            .state
            .borrow()
            .pending
            .get(key)
            .is_some_and(|entry| entry.fetch_issued)
    }

    pub fn properties(&self, key: &InterfaceKey) -> Option<PropertyMap> {
        let state = self.inner.state.borrow();
        if !state.is_ready(key) {
            return None;
        }
        state.cache.get(key).cloned()
    }

    pub fn property(&self, key: &InterfaceKey, name: &str) -> Option<serde_json::Value> {
        let state = self.inner.state.borrow();
        if !state.is_ready(key) {
            return None;
        }
        state.cache.get(key).and_then(|props| props.get(name)).cloned()
    }

    /// Call `callback` once `key` is ready on this object.
    ///
    /// Returns `true` if this call sent the underlying fetch.
    pub fn register<F>(
        &self,
        key: &InterfaceKey,
        callback: F,
        weak_target: Option<&WeakTarget>,
    ) -> bool
    where
        F: FnOnce(Result<(), BrokerError>) + 'static,
    {
        self.register_waiter(key, callback, weak_target).triggered_fetch
    }

    /// Like [`Proxy::register`], also returning the waiter for [`Proxy::cancel`].
    pub fn register_waiter<F>(
        &self,
        key: &InterfaceKey,
        callback: F,
        weak_target: Option<&WeakTarget>,
    ) -> Registration
    where
        F: FnOnce(Result<(), BrokerError>) + 'static,
    {
        let target_alive = weak_target.map_or(true, WeakTarget::is_alive);
        let (ready, invalidated) = {
            let state = self.inner.state.borrow();
            (state.is_ready(key), state.invalidated.clone())
        };

        if ready || invalidated.is_some() {
            let outcome = match invalidated {
                Some(error) => Err(error),
                None => Ok(()),
            };
            if target_alive {
                callback(outcome);
            } else {
                drop(callback);
            }
            return Registration {
                triggered_fetch: false,
                waiter: None,
            };
        }

        if !target_alive {
            log::trace!("ready({}): waiter for {} arrived with dead target", self.path(), key);
            drop(callback);
            return Registration {
                triggered_fetch: false,
                waiter: None,
            };
        }

        let seq = {
            let mut state = self.inner.state.borrow_mut();
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };
        let waiter_id = WaiterId {
            key: key.clone(),
            seq,
        };
        let guard = weak_target.and_then(|target| {
            let proxy = self.downgrade();
            let id = waiter_id.clone();
            target.watch(move || {
                if let Some(proxy) = proxy.upgrade() {
                    proxy.cancel(&id);
                }
            })
        });

        let (epoch, triggered_fetch) = {
            let mut guard_state = self.inner.state.borrow_mut();
            let state = &mut *guard_state;
            let next_epoch = state.next_epoch;
            let entry = state.pending.entry(key.clone()).or_insert_with(|| ReadinessEntry {
                waiters: Vec::new(),
                fetch_issued: false,
                epoch: next_epoch,
                stale: false,
            });
            if entry.epoch == next_epoch {
                state.next_epoch += 1;
            }
            entry.waiters.push(Waiter {
                seq,
                callback: Some(Box::new(callback)),
                target: weak_target.cloned(),
                guard,
            });
            let triggered = !entry.fetch_issued;
            entry.fetch_issued = true;
            (entry.epoch, triggered)
        };

        if triggered_fetch {
            log::debug!("ready({}): fetching {}", self.path(), key);
            self.issue_fetch(key, epoch);
        } else {
            log::trace!("ready({}): queued behind fetch of {}", self.path(), key);
        }

        // A synchronous transport may already have delivered.
        let still_queued = self
            .inner
            .state
            .borrow()
            .pending
            .get(key)
            .is_some_and(|entry| entry.waiters.iter().any(|w| w.seq == seq));
        Registration {
            triggered_fetch,
            waiter: still_queued.then_some(waiter_id),
        }
    }

    /// Withdraw a queued waiter; its callback is released without running.
    ///
    /// The waiter's slot stays in its entry until the entry completes.
    /// Cancelling twice, or after delivery, does nothing.
    pub fn cancel(&self, waiter: &WaiterId) {
        let released = {
            let mut state = self.inner.state.borrow_mut();
            state.pending.get_mut(&waiter.key).and_then(|entry| {
                entry
                    .waiters
                    .iter_mut()
                    .find(|w| w.seq == waiter.seq)
                    .and_then(|w| w.callback.take().map(|cb| (cb, w.guard.take())))
            })
        };
        if released.is_some() {
            log::trace!("ready({}): waiter on {} cancelled", self.path(), waiter.key);
        }
        drop(released);
    }

    fn issue_fetch(&self, key: &InterfaceKey, epoch: u64) {
        let proxy = self.downgrade();
        let reply_key = key.clone();
        let reply = Reply::new("fetch", move |result| {
            if let Some(proxy) = proxy.upgrade() {
                proxy.on_fetch_complete(&reply_key, epoch, result);
            }
        });
        self.inner.transport.issue_fetch(self.path(), key, reply);
    }

    fn on_fetch_complete(
        &self,
        key: &InterfaceKey,
        epoch: u64,
        result: Result<PropertyMap, BrokerError>,
    ) {
        let waiters = {
            let mut guard_state = self.inner.state.borrow_mut();
            let state = &mut *guard_state;
            let stale = match state.pending.get_mut(key) {
                Some(entry) if entry.epoch == epoch => entry.stale,
                _ => {
                    log::debug!("ready({}): dropping stale reply for {}", self.inner.path, key);
                    return;
                }
            };
            // A stale success is replaced by a fresh fetch; a failure settles.
            if stale && result.is_ok() {
                let next_epoch = state.next_epoch;
                state.next_epoch += 1;
                if let Some(entry) = state.pending.get_mut(key) {
                    entry.epoch = next_epoch;
                    entry.stale = false;
                }
                drop(guard_state);
                log::debug!("ready({}): refetching {} after refresh", self.inner.path, key);
                self.issue_fetch(key, next_epoch);
                return;
            }
            let Some(entry) = state.pending.remove(key) else {
                return;
            };
            match &result {
                Ok(props) => {
                    state.cache.insert(key.clone(), props.clone());
                }
                Err(err) => {
                    log::debug!("ready({}): fetch of {} failed: {}", self.inner.path, key, err);
                }
            }
            entry.waiters
        };
        let outcome = result.map(|_| ());
        for waiter in waiters {
            waiter.deliver(outcome.clone());
        }
    }

    /// Mark the object dead. Every pending waiter receives `error`; every
    /// later registration receives it too. Only the first call has effect.
    pub fn invalidate(&self, error: BrokerError) {
        let pending = {
            let mut state = self.inner.state.borrow_mut();
            if state.invalidated.is_some() {
                return;
            }
            state.invalidated = Some(error.clone());
            state.cache.clear();
            std::mem::take(&mut state.pending)
        };
        log::debug!("ready({}): invalidated: {}", self.inner.path, error);
        let subscription = self.inner.subscription.borrow_mut().take();
        drop(subscription);
        for (_, entry) in pending {
            for waiter in entry.waiters {
                waiter.deliver(Err(error.clone()));
            }
        }
    }

    /// Forget the cached value of `key`; the next registration refetches.
    ///
    /// A fetch already in flight is superseded: when it succeeds, its waiters
    /// stay queued behind a new fetch instead of seeing the old reply.
    pub fn refresh(&self, key: &InterfaceKey) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(entry) = state.pending.get_mut(key) {
            entry.stale = true;
            log::trace!("ready({}): in-flight fetch of {} superseded", self.inner.path, key);
            return;
        }
        if state.cache.remove(key).is_some() {
            log::trace!("ready({}): {} marked stale", self.inner.path, key);
        }
    }

    /// Merge changed properties into `key`, if it is ready.
    pub fn apply_changes(&self, key: &InterfaceKey, changed: &PropertyMap) -> bool {
        let mut state = self.inner.state.borrow_mut();
        if !state.is_ready(key) {
            return false;
        }
        match state.cache.get_mut(key) {
            Some(props) => {
                props.extend(changed.iter().map(|(name, value)| (name.clone(), value.clone())));
                true
            }
            None => false,
        }
    }

    fn handle_signal(&self, signal: &BusSignal) {
        match &signal.kind {
            SignalKind::PropertiesChanged { interface, changed } => {
                self.apply_changes(interface, changed);
            }
            SignalKind::Removed => {
                self.invalidate(BrokerError::invalidated("object removed from bus"));
            }
            SignalKind::Request(_) => {}
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Proxy")
            .field("path", &self.inner.path)
            .field("ready", &state.cache.keys().collect::<Vec<_>>())
            .field("pending", &state.pending.keys().collect::<Vec<_>>())
            .field("invalidated", &state.invalidated)
            .finish()
    }
}

#[derive(Clone)]
pub struct WeakProxy {
    inner: Weak<ProxyInner>,
}

impl WeakProxy {
    pub fn upgrade(&self) -> Option<Proxy> {
        self.inner.upgrade().map(|inner| Proxy { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::cell::Cell;

    fn key(name: &str) -> InterfaceKey {
        InterfaceKey::new(name)
    }

    fn props(pairs: &[(&str, serde_json::Value)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    fn setup() -> (Rc<MockTransport>, Proxy) {
        let transport = Rc::new(MockTransport::new());
        let path = ObjectPath::new("/test/Object").expect("path");
        let proxy = Proxy::new(path, transport.clone());
        (transport, proxy)
    }

    type Log = Rc<RefCell<Vec<(String, Result<(), BrokerError>)>>>;

    fn recorder(log: &Log, label: &str) -> impl FnOnce(Result<(), BrokerError>) + 'static {
        let log = log.clone();
        let label = label.to_owned();
        move |result| log.borrow_mut().push((label, result))
    }

    #[test]
    fn single_flight_fans_out_to_every_waiter() {
        let (transport, proxy) = setup();
        let log: Log = Rc::default();
        let k = key("a.Core");

        assert!(proxy.register(&k, recorder(&log, "a"), None));
        assert!(!proxy.register(&k, recorder(&log, "b"), None));
        assert!(!proxy.register(&k, recorder(&log, "c"), None));
        assert_eq!(transport.fetch_count(), 1);
        assert!(proxy.is_fetching(&k));
        assert_eq!(proxy.pending_waiters(&k), 3);

        transport.complete_fetch(&k, Ok(props(&[("Name", json!("x"))])));
        let log = log.borrow();
        let labels: Vec<&str> = log.iter().map(|(label, _)| label.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert!(log.iter().all(|(_, result)| result.is_ok()));
    }

    #[test]
    fn ready_key_answers_synchronously_without_fetch() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        proxy.register(&k, |_| {}, None);
        transport.complete_fetch(&k, Ok(props(&[("Name", json!("x"))])));
        assert!(proxy.is_ready(&k));
        assert_eq!(proxy.property(&k, "Name"), Some(json!("x")));

        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        assert!(!proxy.register(&k, move |result| h.set(result.is_ok()), None));
        assert!(hit.get());
        assert_eq!(transport.fetch_count(), 1);
    }

    #[test]
    fn failure_leaves_key_unready_and_next_register_refetches() {
        let (transport, proxy) = setup();
        let log: Log = Rc::default();
        let k = key("a.Core");
        proxy.register(&k, recorder(&log, "a"), None);
        proxy.register(&k, recorder(&log, "b"), None);
        transport.complete_fetch(&k, Err(BrokerError::transport("timeout")));

        assert_eq!(log.borrow().len(), 2);
        assert!(log
            .borrow()
            .iter()
            .all(|(_, r)| matches!(r, Err(BrokerError::Transport { .. }))));
        assert!(!proxy.is_ready(&k));

        assert!(proxy.register(&k, recorder(&log, "c"), None));
        assert_eq!(transport.fetch_count(), 2);
    }

    #[test]
    fn dead_target_cancels_waiter_and_releases_its_data() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        let target = Target::new();
        let payload = Rc::new(());
        let held = payload.clone();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let registration = proxy.register_waiter(
            &k,
            move |_| {
                let _keep = &held;
                f.set(true);
            },
            Some(&target.downgrade()),
        );
        assert!(registration.waiter.is_some());
        assert_eq!(Rc::strong_count(&payload), 2);

        drop(target);
        assert_eq!(Rc::strong_count(&payload), 1, "user data released on cancel");
        assert_eq!(proxy.pending_waiters(&k), 0);

        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        assert!(!fired.get());
    }

    #[test]
    fn ready_key_with_dead_target_skips_callback_but_releases() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        proxy.register(&k, |_| {}, None);
        transport.complete_fetch(&k, Ok(PropertyMap::new()));

        let target = Target::new();
        let weak = target.downgrade();
        drop(target);
        let payload = Rc::new(());
        let held = payload.clone();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        proxy.register(
            &k,
            move |_| {
                let _keep = &held;
                f.set(true);
            },
            Some(&weak),
        );
        assert!(!fired.get());
        assert_eq!(Rc::strong_count(&payload), 1);
    }

    #[test]
    fn target_released_inside_sibling_callback_is_safe() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        let log: Log = Rc::default();
        let victim = Rc::new(RefCell::new(Some(Target::new())));
        let victim_weak = victim.borrow().as_ref().map(Target::downgrade).expect("victim");

        let slot = victim.clone();
        let l = log.clone();
        proxy.register(
            &k,
            move |result| {
                l.borrow_mut().push(("killer".into(), result));
                drop(slot.borrow_mut().take());
            },
            None,
        );
        proxy.register(&k, recorder(&log, "victim"), Some(&victim_weak));
        proxy.register(&k, recorder(&log, "after"), None);

        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        let labels: Vec<String> = log.borrow().iter().map(|(label, _)| label.clone()).collect();
        assert_eq!(labels, vec!["killer".to_owned(), "after".to_owned()]);
        assert!(victim.borrow().is_none());
    }

    #[test]
    fn explicit_cancel_is_idempotent() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        let log: Log = Rc::default();
        let first = proxy.register_waiter(&k, recorder(&log, "a"), None);
        proxy.register(&k, recorder(&log, "b"), None);
        let id = first.waiter.expect("queued");
        proxy.cancel(&id);
        proxy.cancel(&id);
        assert_eq!(proxy.pending_waiters(&k), 1);

        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        proxy.cancel(&id);
        let labels: Vec<String> = log.borrow().iter().map(|(label, _)| label.clone()).collect();
        assert_eq!(labels, vec!["b".to_owned()]);
    }

    #[test]
    fn invalidate_notifies_pending_and_future_waiters() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        let other = key("a.Avatar");
        let log: Log = Rc::default();
        proxy.register(&other, |_| {}, None);
        transport.complete_fetch(&other, Ok(PropertyMap::new()));
        proxy.register(&k, recorder(&log, "pending"), None);

        proxy.invalidate(BrokerError::invalidated("account deleted"));
        proxy.invalidate(BrokerError::invalidated("second call ignored"));
        assert!(proxy.is_invalidated());
        assert!(!proxy.is_ready(&other));

        proxy.register(&other, recorder(&log, "late"), None);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        for (_, result) in log.iter() {
            assert_eq!(
                result,
                &Err(BrokerError::invalidated("account deleted"))
            );
        }

        // The in-flight reply lands after invalidation and changes nothing.
        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        assert!(!proxy.is_ready(&k));
    }

    #[test]
    fn releasing_proxy_invalidates_waiters() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        let log: Log = Rc::default();
        proxy.register(&k, recorder(&log, "a"), None);
        drop(proxy);
        assert_eq!(
            log.borrow().as_slice(),
            &[("a".to_owned(), Err(BrokerError::invalidated("proxy released")))]
        );
        // Completing the orphaned reply must be a no-op.
        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn synchronous_transport_delivers_within_register() {
        let transport = Rc::new(MockTransport::new());
        transport.set_auto_fetch(Some(Ok(props(&[("Valid", json!(true))]))));
        let proxy = Proxy::new(ObjectPath::new("/sync").expect("path"), transport.clone());
        let k = key("a.Core");
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let registration = proxy.register_waiter(&k, move |r| h.set(r.is_ok()), None);
        assert!(registration.triggered_fetch);
        assert!(registration.waiter.is_none());
        assert!(hit.get());
        assert!(proxy.is_ready(&k));
    }

    #[test]
    fn callback_may_reregister_same_key() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        let inner_hit = Rc::new(Cell::new(false));
        let again = proxy.clone();
        let k2 = k.clone();
        let h = inner_hit.clone();
        proxy.register(
            &k,
            move |_| {
                again.register(&k2, move |r| h.set(r.is_ok()), None);
            },
            None,
        );
        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        assert!(inner_hit.get(), "key is ready before waiters run");
        assert_eq!(transport.fetch_count(), 1);
    }

    #[test]
    fn signals_update_cache_and_invalidate() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        proxy.register(&k, |_| {}, None);
        transport.complete_fetch(&k, Ok(props(&[("Name", json!("old"))])));

        transport.emit(BusSignal {
            path: proxy.path().clone(),
            kind: SignalKind::PropertiesChanged {
                interface: k.clone(),
                changed: props(&[("Name", json!("new"))]),
            },
        });
        assert_eq!(proxy.property(&k, "Name"), Some(json!("new")));

        transport.emit(BusSignal {
            path: proxy.path().clone(),
            kind: SignalKind::Removed,
        });
        assert!(proxy.is_invalidated());
        assert_eq!(transport.subscriber_count(), 0);
    }

    #[test]
    fn refresh_makes_key_stale() {
        let (transport, proxy) = setup();
        let k = key("a.Core");
        proxy.register(&k, |_| {}, None);
        transport.complete_fetch(&k, Ok(PropertyMap::new()));
        proxy.refresh(&k);
        assert!(!proxy.is_ready(&k));
        assert!(proxy.register(&k, |_| {}, None));
        assert_eq!(transport.fetch_count(), 2);
    }

    #[test]
    fn refresh_during_fetch_discards_the_old_reply() {
        let (transport, proxy) = setup();
        let log: Log = Rc::default();
        let k = key("a.Core");
        assert!(proxy.register(&k, recorder(&log, "a"), None));
        proxy.refresh(&k);

        assert!(transport.complete_fetch(&k, Ok(props(&[("Enabled", json!(true))]))));
        assert!(log.borrow().is_empty());
        assert!(!proxy.is_ready(&k));
        assert_eq!(transport.fetch_count(), 2);
        assert_eq!(transport.pending_fetches(), 1);
        assert!(!proxy.register(&k, recorder(&log, "b"), None));

        assert!(transport.complete_fetch(&k, Ok(props(&[("Enabled", json!(false))]))));
        let labels: Vec<String> = log.borrow().iter().map(|(label, _)| label.clone()).collect();
        assert_eq!(labels, vec!["a", "b"]);
        assert_eq!(proxy.property(&k, "Enabled"), Some(json!(false)));
        assert_eq!(transport.fetch_count(), 2);
    }

    #[test]
    fn refresh_during_failed_fetch_still_settles_waiters() {
        let (transport, proxy) = setup();
        let log: Log = Rc::default();
        let k = key("a.Core");
        proxy.register(&k, recorder(&log, "a"), None);
        proxy.refresh(&k);

        transport.complete_fetch(&k, Err(BrokerError::transport("gone")));
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].1.is_err());
        assert_eq!(transport.pending_fetches(), 0);
        assert!(!proxy.is_fetching(&k));
    }
}
