//! Waiting on several readiness keys at once.
//!
//! An [`AggregateWait`] starts with one hold for "registration in progress",
//! adds one per tracked key, and fires its callback when the count drops to
//! zero. The hold keeps a key that is already ready (and therefore answers
//! synchronously) from completing the aggregate before later keys have been
//! registered.

use std::cell::RefCell;
use std::rc::Rc;

use switchboard_ipc::{BrokerError, InterfaceKey};

use crate::readiness::{Proxy, ReadyCallback};
use crate::target::WeakTarget;

struct AggregateState {
    remaining: usize,
    first_error: Option<BrokerError>,
    callback: Option<ReadyCallback>,
    target: Option<WeakTarget>,
}

/// Collapses N readiness waits into one callback reporting the first error.
///
/// Memory is reference counted separately from `remaining`: each pending key
/// holds a clone until its waiter is delivered or cancelled.
pub struct AggregateWait {
    state: Rc<RefCell<AggregateState>>,
    finished: bool,
}

impl AggregateWait {
    pub fn new<F>(callback: F, weak_target: Option<&WeakTarget>) -> Self
    where
        F: FnOnce(Result<(), BrokerError>) + 'static,
    {
        Self {
            state: Rc::new(RefCell::new(AggregateState {
                remaining: 1,
                first_error: None,
                callback: Some(Box::new(callback)),
                target: weak_target.cloned(),
            })),
            finished: false,
        }
    }

    /// Add `key` on `proxy` to the set. Returns `true` if a fetch was sent.
    pub fn track(&self, proxy: &Proxy, key: &InterfaceKey) -> bool {
        self.state.borrow_mut().remaining += 1;
        let state = self.state.clone();
        let target = self.state.borrow().target.clone();
        proxy.register(
            key,
            move |result| on_key_done(&state, result),
            target.as_ref(),
        )
    }

    /// Release the registration hold. The callback may run before this returns.
    pub fn finish(mut self) {
        self.release_hold();
    }

    fn release_hold(&mut self) {
        if !self.finished {
            self.finished = true;
            on_key_done(&self.state, Ok(()));
        }
    }
}

impl Drop for AggregateWait {
    fn drop(&mut self) {
        self.release_hold();
    }
}

fn on_key_done(state: &Rc<RefCell<AggregateState>>, result: Result<(), BrokerError>) {
    let fire = {
        let mut state = state.borrow_mut();
        if let Err(error) = result {
            if state.first_error.is_none() {
                state.first_error = Some(error);
            }
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            state
                .callback
                .take()
                .map(|callback| (callback, state.first_error.take(), state.target.clone()))
        } else {
            None
        }
    };
    let Some((callback, first_error, target)) = fire else {
        return;
    };
    if target.as_ref().map_or(true, WeakTarget::is_alive) {
        callback(match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        });
    }
}

/// Call `callback` once every key in `keys` is ready on `proxy`, or with the
/// first error any of them reported.
///
/// Returns the number of fetches this call sent.
pub fn wait_all<F>(
    proxy: &Proxy,
    keys: &[InterfaceKey],
    callback: F,
    weak_target: Option<&WeakTarget>,
) -> usize
where
    F: FnOnce(Result<(), BrokerError>) + 'static,
{
    let aggregate = AggregateWait::new(callback, weak_target);
    let fetches = keys
        .iter()
        .filter(|key| aggregate.track(proxy, key))
        .count();
    aggregate.finish();
    fetches
}
