//! Delay tokens for orderly teardown.
//!
//! Whoever drives a shutdown installs an [`Inhibitor`] in an [`InhibitSlot`],
//! starts disconnecting, and waits for the inhibitor to be released. Missions
//! that need to finish a round trip first take a hold from the slot and keep
//! it until their reply arrives.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

struct InhibitInner {
    label: String,
    holds: Cell<usize>,
    released: Notify,
}

/// Reference-counted delay token.
#[derive(Clone)]
pub struct Inhibitor {
    inner: Rc<InhibitInner>,
}

impl Inhibitor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(InhibitInner {
                label: label.into(),
                holds: Cell::new(0),
                released: Notify::new(),
            }),
        }
    }

    pub fn hold(&self) -> InhibitGuard {
        let holds = self.inner.holds.get() + 1;
        self.inner.holds.set(holds);
        log::trace!("inhibit({}): hold, {} outstanding", self.inner.label, holds);
        InhibitGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn holds(&self) -> usize {
        self.inner.holds.get()
    }

    /// Resolve once no holds are outstanding.
    pub async fn released(&self) {
        loop {
            if self.inner.holds.get() == 0 {
                return;
            }
            let notified = self.inner.released.notified();
            if self.inner.holds.get() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for release. Returns `false` on timeout.
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.released()).await {
            Ok(()) => true,
            Err(_) => {
                log::warn!(
                    "inhibit({}): {} holds still outstanding after {:?}",
                    self.inner.label,
                    self.inner.holds.get(),
                    timeout
                );
                false
            }
        }
    }
}

impl fmt::Debug for Inhibitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inhibitor")
            .field("label", &self.inner.label)
            .field("holds", &self.inner.holds.get())
            .finish()
    }
}

/// One outstanding hold; released on drop.
#[must_use = "the hold is released as soon as the guard is dropped"]
pub struct InhibitGuard {
    inner: Rc<InhibitInner>,
}

impl Drop for InhibitGuard {
    fn drop(&mut self) {
        let holds = self.inner.holds.get().saturating_sub(1);
        self.inner.holds.set(holds);
        if holds == 0 {
            log::debug!("inhibit({}): released", self.inner.label);
            self.inner.released.notify_waiters();
        }
    }
}

impl fmt::Debug for InhibitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InhibitGuard")
            .field("label", &self.inner.label)
            .finish()
    }
}

/// Shared place where the current inhibitor, if any, is installed.
#[derive(Clone, Default)]
pub struct InhibitSlot {
    current: Rc<RefCell<Option<Inhibitor>>>,
}

impl InhibitSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, inhibitor: Inhibitor) {
        *self.current.borrow_mut() = Some(inhibitor);
    }

    pub fn clear(&self) -> Option<Inhibitor> {
        self.current.borrow_mut().take()
    }

    pub fn current(&self) -> Option<Inhibitor> {
        self.current.borrow().clone()
    }

    /// Hold the installed inhibitor, if there is one.
    pub fn hold(&self) -> Option<InhibitGuard> {
        self.current.borrow().as_ref().map(Inhibitor::hold)
    }
}

impl fmt::Debug for InhibitSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InhibitSlot")
            .field("current", &*self.current.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn unheld_inhibitor_is_released_immediately() {
        let inhibitor = Inhibitor::new("idle");
        assert!(inhibitor.wait_released(Duration::from_millis(1)).await);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn release_wakes_waiter() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let inhibitor = Inhibitor::new("offline");
                let first = inhibitor.hold();
                let second = inhibitor.hold();
                assert_eq!(inhibitor.holds(), 2);

                let waiter = inhibitor.clone();
                let task = tokio::task::spawn_local(async move {
                    waiter.wait_released(Duration::from_secs(5)).await
                });
                tokio::task::yield_now().await;
                drop(first);
                tokio::task::yield_now().await;
                assert!(!task.is_finished());
                drop(second);
                assert!(task.await.expect("join"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn outstanding_hold_times_out() {
        let inhibitor = Inhibitor::new("stuck");
        let _hold = inhibitor.hold();
        assert!(!inhibitor.wait_released(Duration::from_secs(5)).await);
        assert_eq!(inhibitor.holds(), 1);
    }

    #[test]
    fn slot_holds_only_when_installed() {
        let slot = InhibitSlot::new();
        assert!(slot.hold().is_none());
        let inhibitor = Inhibitor::new("slot");
        slot.install(inhibitor.clone());
        let guard = slot.hold();
        assert!(guard.is_some());
        assert_eq!(inhibitor.holds(), 1);
        drop(guard);
        assert_eq!(inhibitor.holds(), 0);
        assert!(slot.clear().is_some());
        assert!(slot.current().is_none());
    }
}
