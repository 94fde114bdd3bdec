//! Drives the mission tree from connectivity state.
//!
//! Going offline installs an inhibitor, disconnects the tree and waits for
//! missions that took a hold to finish, up to a timeout. Shutdown does the
//! same and then aborts the tree.

use std::time::Duration;

use switchboard_core::{InhibitSlot, Inhibitor, Operation};
use tokio::sync::watch;

pub struct ConnectivityMonitor {
    root: Operation,
    inhibit: InhibitSlot,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(root: Operation, inhibit: InhibitSlot, timeout: Duration) -> Self {
        Self {
            root,
            inhibit,
            timeout,
        }
    }

    /// Apply the current state, then every change, until the sender is gone.
    pub async fn run(&self, mut state: watch::Receiver<bool>) {
        let online = *state.borrow_and_update();
        self.apply(online).await;
        while state.changed().await.is_ok() {
            let online = *state.borrow_and_update();
            self.apply(online).await;
        }
        log::debug!("connectivity: state source closed");
    }

    pub async fn apply(&self, online: bool) {
        if online {
            log::info!("connectivity: online");
            self.root.connect();
        } else {
            log::info!("connectivity: offline");
            self.go_offline().await;
        }
    }

    /// Disconnect the tree and wait for outstanding holds. Returns `false` if
    /// the timeout expired first.
    pub async fn go_offline(&self) -> bool {
        let inhibitor = Inhibitor::new(self.root.name());
        self.inhibit.install(inhibitor.clone());
        self.root.disconnect();
        let released = inhibitor.wait_released(self.timeout).await;
        self.inhibit.clear();
        released
    }

    /// Orderly teardown: go offline, then abort the whole tree.
    pub async fn shutdown(&self) -> bool {
        log::info!("connectivity: shutting down");
        let released = self.go_offline().await;
        self.root.abort();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use switchboard_core::{InhibitGuard, Mission, MissionHandler};

    /// Takes a hold on every disconnect and keeps it until told otherwise.
    struct Lingering {
        slot: InhibitSlot,
        holds: RefCell<Vec<InhibitGuard>>,
    }

    impl MissionHandler for Lingering {
        fn disconnected(&self, _mission: &Mission) {
            if let Some(guard) = self.slot.hold() {
                self.holds.borrow_mut().push(guard);
            }
        }
    }

    fn tree(slot: &InhibitSlot) -> (Operation, Mission, Rc<Lingering>) {
        let root = Operation::new("root");
        let child = Mission::new("child");
        let handler = Rc::new(Lingering {
            slot: slot.clone(),
            holds: RefCell::new(Vec::new()),
        });
        child.set_handler(handler.clone());
        root.take_mission(&child);
        (root, child, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn offline_gives_up_after_timeout() {
        let slot = InhibitSlot::new();
        let (root, child, handler) = tree(&slot);
        let monitor =
            ConnectivityMonitor::new(root.clone(), slot.clone(), Duration::from_millis(50));
        monitor.apply(true).await;
        assert!(child.is_connected());

        assert!(!monitor.go_offline().await);
        assert!(!child.is_connected());
        assert_eq!(handler.holds.borrow().len(), 1);
        assert!(slot.current().is_none());
    }

    #[tokio::test]
    async fn offline_completes_without_holds() {
        let slot = InhibitSlot::new();
        let (root, child, _handler) = tree(&slot);
        let monitor =
            ConnectivityMonitor::new(root.clone(), InhibitSlot::new(), Duration::from_secs(1));
        monitor.apply(true).await;
        assert!(monitor.shutdown().await);
        assert!(child.is_aborted());
        assert!(root.is_aborted());
    }

    #[tokio::test]
    async fn run_follows_the_watch_until_closed() {
        let slot = InhibitSlot::new();
        let (root, child, _handler) = tree(&slot);
        let monitor = ConnectivityMonitor::new(root, InhibitSlot::new(), Duration::from_secs(1));
        let (tx, rx) = watch::channel(false);

        let driver = async {
            tokio::task::yield_now().await;
            assert!(!child.is_connected());
            tx.send(true).expect("monitor listening");
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            assert!(child.is_connected());
            drop(tx);
        };
        tokio::join!(monitor.run(rx), driver);
        assert!(child.is_connected());
    }
}
