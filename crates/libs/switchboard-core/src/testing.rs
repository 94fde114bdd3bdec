//! In-memory transport for unit tests: records every issued operation and
//! completes it only when the test says so.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use switchboard_ipc::{
    BrokerError, BusSignal, ChannelRequestParams, InterfaceKey, ObjectPath, PropertyMap,
};

use crate::transport::{Reply, SignalSink, Subscription, Transport};

type Sinks = Rc<RefCell<Vec<(u64, ObjectPath, SignalSink)>>>;

#[derive(Default)]
pub(crate) struct MockTransport {
    fetches: RefCell<Vec<(ObjectPath, InterfaceKey, Reply<PropertyMap>)>>,
    fetch_count: Cell<usize>,
    requests: RefCell<Vec<(ObjectPath, ChannelRequestParams, Reply<ObjectPath>)>>,
    calls: RefCell<Vec<(ObjectPath, String, Reply<serde_json::Value>)>>,
    call_log: RefCell<Vec<(ObjectPath, String)>>,
    sinks: Sinks,
    next_sink: Cell<u64>,
    auto_fetch: RefCell<Option<Result<PropertyMap, BrokerError>>>,
    auto_call: RefCell<Option<Result<serde_json::Value, BrokerError>>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Complete every later fetch synchronously, inside `issue_fetch`.
    pub(crate) fn set_auto_fetch(&self, result: Option<Result<PropertyMap, BrokerError>>) {
        *self.auto_fetch.borrow_mut() = result;
    }

    /// Complete every later method call synchronously.
    pub(crate) fn set_auto_call(&self, result: Option<Result<serde_json::Value, BrokerError>>) {
        *self.auto_call.borrow_mut() = result;
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetch_count.get()
    }

    pub(crate) fn pending_fetches(&self) -> usize {
        self.fetches.borrow().len()
    }

    /// Complete the oldest outstanding fetch of `key` on any object.
    pub(crate) fn complete_fetch(
        &self,
        key: &InterfaceKey,
        result: Result<PropertyMap, BrokerError>,
    ) -> bool {
        let reply = {
            let mut fetches = self.fetches.borrow_mut();
            fetches
                .iter()
                .position(|(_, k, _)| k == key)
                .map(|index| fetches.remove(index).2)
        };
        match reply {
            Some(reply) => {
                reply.complete(result);
                true
            }
            None => false,
        }
    }

    /// Complete the oldest outstanding fetch of `key` on `object`.
    pub(crate) fn complete_fetch_on(
        &self,
        object: &ObjectPath,
        key: &InterfaceKey,
        result: Result<PropertyMap, BrokerError>,
    ) -> bool {
        let reply = {
            let mut fetches = self.fetches.borrow_mut();
            fetches
                .iter()
                .position(|(o, k, _)| o == object && k == key)
                .map(|index| fetches.remove(index).2)
        };
        match reply {
            Some(reply) => {
                reply.complete(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.requests.borrow().len()
    }

    pub(crate) fn last_request_params(&self) -> Option<ChannelRequestParams> {
        self.requests.borrow().last().map(|(_, params, _)| params.clone())
    }

    /// Complete the oldest outstanding channel creation.
    pub(crate) fn complete_request(&self, result: Result<ObjectPath, BrokerError>) -> bool {
        let reply = {
            let mut requests = self.requests.borrow_mut();
            if requests.is_empty() {
                None
            } else {
                Some(requests.remove(0).2)
            }
        };
        match reply {
            Some(reply) => {
                reply.complete(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn call_log(&self) -> Vec<(ObjectPath, String)> {
        self.call_log.borrow().clone()
    }

    /// Complete the oldest outstanding call of `method`.
    pub(crate) fn complete_call(
        &self,
        method: &str,
        result: Result<serde_json::Value, BrokerError>,
    ) -> bool {
        let reply = {
            let mut calls = self.calls.borrow_mut();
            calls
                .iter()
                .position(|(_, m, _)| m == method)
                .map(|index| calls.remove(index).2)
        };
        match reply {
            Some(reply) => {
                reply.complete(result);
                true
            }
            None => false,
        }
    }

    /// Deliver `signal` to every subscriber whose root contains its path.
    pub(crate) fn emit(&self, signal: BusSignal) {
        let sinks: Vec<SignalSink> = self
            .sinks
            .borrow()
            .iter()
            .filter(|(_, root, _)| signal.path.is_within(root))
            .map(|(_, _, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink(&signal);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.sinks.borrow().len()
    }
}

impl Transport for MockTransport {
    fn issue_fetch(&self, object: &ObjectPath, key: &InterfaceKey, reply: Reply<PropertyMap>) {
        self.fetch_count.set(self.fetch_count.get() + 1);
        let auto = self.auto_fetch.borrow().clone();
        match auto {
            Some(result) => reply.complete(result),
            None => self
                .fetches
                .borrow_mut()
                .push((object.clone(), key.clone(), reply)),
        }
    }

    fn issue_request(
        &self,
        owner: &ObjectPath,
        params: &ChannelRequestParams,
        reply: Reply<ObjectPath>,
    ) {
        self.requests
            .borrow_mut()
            .push((owner.clone(), params.clone(), reply));
    }

    fn issue_call(
        &self,
        object: &ObjectPath,
        method: &str,
        _args: PropertyMap,
        reply: Reply<serde_json::Value>,
    ) {
        self.call_log
            .borrow_mut()
            .push((object.clone(), method.to_owned()));
        let auto = self.auto_call.borrow().clone();
        match auto {
            Some(result) => reply.complete(result),
            None => self
                .calls
                .borrow_mut()
                .push((object.clone(), method.to_owned(), reply)),
        }
    }

    fn subscribe(&self, root: &ObjectPath, sink: SignalSink) -> Subscription {
        let id = self.next_sink.get();
        self.next_sink.set(id + 1);
        self.sinks.borrow_mut().push((id, root.clone(), sink));
        let sinks = Rc::downgrade(&self.sinks);
        Subscription::new(move || {
            if let Some(sinks) = sinks.upgrade() {
                let removed = {
                    let mut sinks = sinks.borrow_mut();
                    sinks
                        .iter()
                        .position(|(sink_id, _, _)| *sink_id == id)
                        .map(|index| sinks.remove(index))
                };
                drop(removed);
            }
        })
    }
}
