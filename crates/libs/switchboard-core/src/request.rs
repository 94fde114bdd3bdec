//! In-flight channel requests of one owner.
//!
//! A request moves `Pending -> Created -> {Succeeded | Failed | Cancelled}`;
//! a failed create goes straight from `Pending` to `Failed`. The terminal
//! transition happens once: the callback runs, then the request leaves the
//! tracker. A request whose weak target dies is released at that moment
//! without a callback, even from inside another request's callback.
//!
//! Once the create call returns a path the tracker asks the far end to
//! `Proceed`. Terminal signals are therefore only expected after the path is
//! known and can be routed back by [`RequestTracker::route_signal`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use switchboard_ipc::{
    methods, BrokerError, BusSignal, ChannelRequestParams, ObjectPath, PropertyMap, RequestEvent,
    SignalKind,
};

use crate::arena::{Arena, Handle};
use crate::target::{WatchGuard, WeakTarget};
use crate::transport::{Reply, SignalSink, Subscription, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Created,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Opaque, stable identity of one request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(Handle);

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestHandle({:?})", self.0)
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// What a request's callback receives.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOutcome {
    pub handle: RequestHandle,
    pub path: Option<ObjectPath>,
    pub state: RequestState,
    pub error: Option<BrokerError>,
}

pub type RequestCallback = Box<dyn FnOnce(RequestOutcome)>;

struct ChannelRequest {
    params: ChannelRequestParams,
    path: Option<ObjectPath>,
    state: RequestState,
    error: Option<BrokerError>,
    callback: Option<RequestCallback>,
    target: Option<WeakTarget>,
    guard: Option<WatchGuard>,
}

fn terminal_state(event: RequestEvent) -> (RequestState, Option<BrokerError>) {
    match event {
        RequestEvent::Succeeded => (RequestState::Succeeded, None),
        RequestEvent::Failed(error) => (RequestState::Failed, Some(error)),
        RequestEvent::Cancelled => (RequestState::Cancelled, None),
    }
}

struct TrackerInner {
    owner: ObjectPath,
    transport: Rc<dyn Transport>,
    requests: RefCell<Arena<ChannelRequest>>,
    by_path: RefCell<HashMap<ObjectPath, Handle>>,
    subscription: RefCell<Option<Subscription>>,
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        let mut requests = std::mem::take(self.requests.get_mut());
        if requests.is_empty() {
            return;
        }
        log::debug!("request({}): released with {} in flight", self.owner, requests.len());
        let error = BrokerError::invalidated("request owner released");
        for handle in requests.handles() {
            let Some(mut request) = requests.remove(handle) else {
                continue;
            };
            drop(request.guard.take());
            let alive = request.target.as_ref().map_or(true, WeakTarget::is_alive);
            if let (Some(callback), true) = (request.callback.take(), alive) {
                callback(RequestOutcome {
                    handle: RequestHandle(handle),
                    path: request.path.take(),
                    state: RequestState::Failed,
                    error: Some(error.clone()),
                });
            }
        }
    }
}

/// Per-owner collection of in-flight channel requests. Cheap to clone.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Rc<TrackerInner>,
}

impl RequestTracker {
    /// Create a tracker for `owner` and subscribe to request signals.
    pub fn new(owner: ObjectPath, transport: Rc<dyn Transport>) -> Self {
        let inner = Rc::new(TrackerInner {
            owner,
            transport,
            requests: RefCell::new(Arena::new()),
            by_path: RefCell::new(HashMap::new()),
            subscription: RefCell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let sink: SignalSink = Rc::new(move |signal: &BusSignal| {
            if let Some(inner) = weak.upgrade() {
                RequestTracker { inner }.handle_signal(signal);
            }
        });
        let subscription = inner
            .transport
            .subscribe(&ObjectPath::channel_request_root(), sink);
        *inner.subscription.borrow_mut() = Some(subscription);
        Self { inner }
    }

    pub fn owner(&self) -> &ObjectPath {
        &self.inner.owner
    }

    /// Start a request. The handle is valid immediately.
    ///
    /// If `weak_target` is already dead nothing is sent and the returned
    /// handle resolves to nothing.
    pub fn submit<F>(
        &self,
        params: ChannelRequestParams,
        callback: F,
        weak_target: Option<&WeakTarget>,
    ) -> RequestHandle
    where
        F: FnOnce(RequestOutcome) + 'static,
    {
        let handle = RequestHandle(self.inner.requests.borrow_mut().insert(ChannelRequest {
            params: params.clone(),
            path: None,
            state: RequestState::Pending,
            error: None,
            callback: Some(Box::new(callback)),
            target: weak_target.cloned(),
            guard: None,
        }));

        if let Some(target) = weak_target {
            let tracker = self.downgrade();
            let guard = target.watch(move || {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.release(handle);
                }
            });
            match guard {
                Some(guard) => {
                    if let Some(request) = self.inner.requests.borrow_mut().get_mut(handle.0) {
                        request.guard = Some(guard);
                    }
                }
                None => {
                    log::debug!("request({}): {} submitted with dead target", self.owner(), handle);
                    self.release(handle);
                    return handle;
                }
            }
        }

        log::debug!(
            "request({}): {} submitted, type={}",
            self.owner(),
            handle,
            params.channel_type
        );
        let tracker = self.downgrade();
        let reply = Reply::new("create", move |result| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_create_result(handle, result);
            }
        });
        self.inner.transport.issue_request(self.owner(), &params, reply);
        handle
    }

    /// Record the result of the create call.
    ///
    /// A request that finished or was released before its create reply is
    /// cancelled on the far end instead of proceeded.
    pub fn on_create_result(
        &self,
        handle: RequestHandle,
        result: Result<ObjectPath, BrokerError>,
    ) {
        let path = match result {
            Ok(path) => path,
            Err(error) => {
                log::debug!("request({}): {} create failed: {}", self.owner(), handle, error);
                self.on_terminal_signal(handle, RequestEvent::Failed(error));
                return;
            }
        };
        let orphaned = {
            let mut requests = self.inner.requests.borrow_mut();
            match requests.get_mut(handle.0) {
                None => true,
                Some(request) if request.state != RequestState::Pending => {
                    log::warn!("request({}): {} created twice", self.owner(), handle);
                    return;
                }
                Some(request) => {
                    request.path = Some(path.clone());
                    request.state = RequestState::Created;
                    false
                }
            }
        };
        if orphaned {
            self.cancel_orphan(handle, &path);
            return;
        }
        self.inner.by_path.borrow_mut().insert(path.clone(), handle.0);
        log::trace!("request({}): {} created at {}", self.owner(), handle, path);

        let tracker = self.downgrade();
        let reply = Reply::new("proceed", move |result: Result<serde_json::Value, BrokerError>| {
            if let (Some(tracker), Err(error)) = (tracker.upgrade(), result) {
                tracker.on_terminal_signal(handle, RequestEvent::Failed(error));
            }
        });
        self.inner
            .transport
            .issue_call(&path, methods::PROCEED, PropertyMap::new(), reply);
    }

    fn cancel_orphan(&self, handle: RequestHandle, path: &ObjectPath) {
        log::debug!(
            "request({}): {} created after release at {}, cancelling",
            self.owner(),
            handle,
            path
        );
        let owner = self.owner().clone();
        let reply = Reply::new("cancel", move |result: Result<serde_json::Value, BrokerError>| {
            if let Err(error) = result {
                log::debug!("request({}): cancelling orphan {} failed: {}", owner, handle, error);
            }
        });
        self.inner
            .transport
            .issue_call(path, methods::CANCEL, PropertyMap::new(), reply);
    }

    /// Deliver the terminal `event`, then drop the request unless its target
    /// released it meanwhile. Returns `false` if the request was already gone
    /// or already finished.
    pub fn on_terminal_signal(&self, handle: RequestHandle, event: RequestEvent) -> bool {
        let delivery = {
            let mut requests = self.inner.requests.borrow_mut();
            let Some(request) = requests.get_mut(handle.0) else {
                log::trace!(
                    "request({}): {} already gone, ignoring {:?}",
                    self.owner(),
                    handle,
                    event
                );
                return false;
            };
            if request.state.is_terminal() {
                log::warn!(
                    "request({}): {} finished twice, ignoring {:?}",
                    self.owner(),
                    handle,
                    event
                );
                return false;
            }
            log::debug!("request({}): {} finished: {:?}", self.owner(), handle, event);
            let (state, error) = terminal_state(event);
            request.state = state;
            request.error = error.clone();
            let outcome = RequestOutcome {
                handle,
                path: request.path.clone(),
                state,
                error,
            };
            (request.callback.take(), request.target.clone(), outcome)
        };
        let (callback, target, outcome) = delivery;
        if let Some(callback) = callback {
            if target.as_ref().map_or(true, WeakTarget::is_alive) {
                callback(outcome);
            }
        }
        let finished = self.take(handle);
        drop(finished);
        true
    }

    /// Route a terminal event for the request object at `path`.
    pub fn route_signal(&self, path: &ObjectPath, event: RequestEvent) -> bool {
        match self.handle_for_path(path) {
            Some(handle) => self.on_terminal_signal(handle, event),
            None => false,
        }
    }

    /// Cancellation is not supported; the request runs to completion.
    pub fn cancel(&self, handle: RequestHandle) -> Result<(), BrokerError> {
        log::warn!("request({}): cancel of {} is not implemented", self.owner(), handle);
        Err(BrokerError::not_implemented("cancel"))
    }

    pub fn get_path(&self, handle: RequestHandle) -> Option<ObjectPath> {
        self.inner
            .requests
            .borrow()
            .get(handle.0)
            .and_then(|request| request.path.clone())
    }

    pub fn get_error(&self, handle: RequestHandle) -> Option<BrokerError> {
        self.inner
            .requests
            .borrow()
            .get(handle.0)
            .and_then(|request| request.error.clone())
    }

    pub fn get_state(&self, handle: RequestHandle) -> Option<RequestState> {
        self.inner
            .requests
            .borrow()
            .get(handle.0)
            .map(|request| request.state)
    }

    pub fn get_params(&self, handle: RequestHandle) -> Option<ChannelRequestParams> {
        self.inner
            .requests
            .borrow()
            .get(handle.0)
            .map(|request| request.params.clone())
    }

    pub fn handle_for_path(&self, path: &ObjectPath) -> Option<RequestHandle> {
        self.inner.by_path.borrow().get(path).copied().map(RequestHandle)
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.inner.requests.borrow().contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.inner.requests.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every request still in flight with `error`.
    pub fn fail_all(&self, error: BrokerError) -> usize {
        let handles = self.inner.requests.borrow().handles();
        handles
            .into_iter()
            .filter(|handle| {
                self.on_terminal_signal(RequestHandle(*handle), RequestEvent::Failed(error.clone()))
            })
            .count()
    }

    fn take(&self, handle: RequestHandle) -> Option<ChannelRequest> {
        let request = self.inner.requests.borrow_mut().remove(handle.0)?;
        if let Some(path) = &request.path {
            self.inner.by_path.borrow_mut().remove(path);
        }
        Some(request)
    }

    /// Drop a request whose target died, without running its callback.
    fn release(&self, handle: RequestHandle) {
        let Some(mut request) = self.take(handle) else {
            return;
        };
        log::trace!("request({}): {} released by its target", self.owner(), handle);
        let callback = request.callback.take();
        drop(request);
        drop(callback);
    }

    fn handle_signal(&self, signal: &BusSignal) {
        match &signal.kind {
            SignalKind::Request(event) => {
                self.route_signal(&signal.path, event.clone());
            }
            SignalKind::Removed => {
                self.route_signal(
                    &signal.path,
                    RequestEvent::Failed(BrokerError::invalidated("request object removed")),
                );
            }
            SignalKind::PropertiesChanged { .. } => {}
        }
    }

    fn downgrade(&self) -> WeakRequestTracker {
        WeakRequestTracker {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("owner", &self.inner.owner)
            .field("in_flight", &self.len())
            .finish()
    }
}

struct WeakRequestTracker {
    inner: Weak<TrackerInner>,
}

impl WeakRequestTracker {
    fn upgrade(&self) -> Option<RequestTracker> {
        self.inner.upgrade().map(|inner| RequestTracker { inner })
    }
}
