//! Cancellation triggers.
//!
//! A [`Target`] is owned by whoever issued a wait or a request on behalf of
//! some longer-lived object. Dropping it notifies every observer exactly once;
//! pending work tied to it is cancelled by those observers. Code that only
//! needs to check liveness or observe release holds a [`WeakTarget`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

type Observer = Box<dyn FnOnce()>;

struct TargetInner {
    alive: Cell<bool>,
    next_id: Cell<u64>,
    observers: RefCell<Vec<(u64, Observer)>>,
}

/// Owned cancellation trigger. Release fires all observers once.
pub struct Target {
    inner: Rc<TargetInner>,
}

impl Target {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(TargetInner {
                alive: Cell::new(true),
                next_id: Cell::new(0),
                observers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakTarget {
        WeakTarget {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.inner.alive.set(false);
        // One at a time, unborrowed: an observer may release other targets or
        // drop guards of observers that have not run yet.
        loop {
            let next = {
                let mut observers = self.inner.observers.borrow_mut();
                if observers.is_empty() {
                    break;
                }
                observers.remove(0)
            };
            (next.1)();
        }
    }
}

/// Non-owning view of a [`Target`].
#[derive(Clone)]
pub struct WeakTarget {
    inner: Weak<TargetInner>,
}

impl WeakTarget {
    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.alive.get())
    }

    /// Run `observer` once when the target is released.
    ///
    /// Returns `None` without registering anything if the target is already
    /// gone. Dropping the returned guard unregisters the observer.
    pub fn watch(&self, observer: impl FnOnce() + 'static) -> Option<WatchGuard> {
        let inner = self.inner.upgrade()?;
        if !inner.alive.get() {
            return None;
        }
        let id = inner.next_id.get();
        inner.next_id.set(id + 1);
        inner.observers.borrow_mut().push((id, Box::new(observer)));
        Some(WatchGuard {
            inner: self.inner.clone(),
            id,
        })
    }
}

impl fmt::Debug for WeakTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTarget")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Registration of one observer on a target; unregisters on drop.
pub struct WatchGuard {
    inner: Weak<TargetInner>,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // Take the observer out first: dropping its captures may reenter.
        let removed = {
            let mut observers = inner.observers.borrow_mut();
            observers
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| observers.remove(index))
        };
        drop(removed);
    }
}
