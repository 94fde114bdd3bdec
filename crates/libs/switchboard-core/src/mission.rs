//! Lifecycle tree of missions.
//!
//! A [`Mission`] is a node that can be connected, disconnected and aborted.
//! An [`Operation`] is a mission that owns child missions and cascades those
//! transitions to them, children first. Abort is terminal.
//!
//! A parent listens for each child's abort and drops the child when it
//! aborts on its own. While the parent is running its own abort cascade it
//! ignores those signals; children aborted by the cascade stay in the list
//! until they are removed explicitly.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

/// Hooks run after a mission changes state.
pub trait MissionHandler {
    fn connected(&self, _mission: &Mission) {}
    fn disconnected(&self, _mission: &Mission) {}
    fn aborted(&self, _mission: &Mission) {}
}

type AbortListener = Rc<dyn Fn(&Mission)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ChildSlot {
    mission: Mission,
    listener: ListenerId,
}

struct MissionInner {
    name: String,
    parent: RefCell<Weak<MissionInner>>,
    connected: Cell<bool>,
    aborted: Cell<bool>,
    cascading: Cell<bool>,
    children: RefCell<Vec<ChildSlot>>,
    abort_listeners: RefCell<Vec<(ListenerId, AbortListener)>>,
    next_listener: Cell<u64>,
    handler: RefCell<Option<Rc<dyn MissionHandler>>>,
}

/// A lifecycle node. Cloning shares the node.
#[derive(Clone)]
pub struct Mission {
    inner: Rc<MissionInner>,
}

impl Mission {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into())
    }

    fn build(name: String) -> Self {
        Self {
            inner: Rc::new(MissionInner {
                name,
                parent: RefCell::new(Weak::new()),
                connected: Cell::new(false),
                aborted: Cell::new(false),
                cascading: Cell::new(false),
                children: RefCell::new(Vec::new()),
                abort_listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
                handler: RefCell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn set_handler(&self, handler: Rc<dyn MissionHandler>) {
        *self.inner.handler.borrow_mut() = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// The operation that currently owns this mission.
    pub fn parent(&self) -> Option<Operation> {
        self.inner
            .parent
            .borrow()
            .upgrade()
            .map(|inner| Operation(Mission { inner }))
    }

    pub fn ptr_eq(&self, other: &Mission) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connect children first, then this node. No effect once aborted.
    pub fn connect(&self) {
        if self.is_aborted() {
            log::debug!("mission({}): connect ignored, aborted", self.name());
            return;
        }
        for child in self.children_snapshot() {
            child.connect();
        }
        if !self.inner.connected.replace(true) {
            log::trace!("mission({}): connected", self.name());
            if let Some(handler) = self.handler() {
                handler.connected(self);
            }
        }
    }

    /// Disconnect children first, then this node.
    pub fn disconnect(&self) {
        if self.is_aborted() {
            return;
        }
        for child in self.children_snapshot() {
            child.disconnect();
        }
        if self.inner.connected.replace(false) {
            log::trace!("mission({}): disconnected", self.name());
            if let Some(handler) = self.handler() {
                handler.disconnected(self);
            }
        }
    }

    /// Abort this node and, for an operation, every current child.
    ///
    /// Children are aborted before this node's own hooks and listeners run.
    pub fn abort(&self) {
        if self.inner.aborted.replace(true) {
            return;
        }
        log::debug!("mission({}): aborting", self.name());
        let children = self.children_snapshot();
        if !children.is_empty() {
            let was_cascading = self.inner.cascading.replace(true);
            for child in &children {
                child.abort();
            }
            self.inner.cascading.set(was_cascading);
        }
        self.inner.connected.set(false);
        if let Some(handler) = self.handler() {
            handler.aborted(self);
        }
        let listeners: Vec<AbortListener> = self
            .inner
            .abort_listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(self);
        }
    }

    /// Run `listener` when this mission aborts.
    pub fn connect_abort(&self, listener: impl Fn(&Mission) + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.get());
        self.inner.next_listener.set(id.0 + 1);
        self.inner
            .abort_listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        id
    }

    pub fn disconnect_abort(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.inner.abort_listeners.borrow_mut();
            listeners
                .iter()
                .position(|(listener_id, _)| *listener_id == id)
                .map(|index| listeners.remove(index))
        };
        removed.is_some()
    }

    fn handler(&self) -> Option<Rc<dyn MissionHandler>> {
        self.inner.handler.borrow().clone()
    }

    fn children_snapshot(&self) -> Vec<Mission> {
        self.inner
            .children
            .borrow()
            .iter()
            .map(|slot| slot.mission.clone())
            .collect()
    }
}

impl fmt::Debug for Mission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mission")
            .field("name", &self.inner.name)
            .field("connected", &self.inner.connected.get())
            .field("aborted", &self.inner.aborted.get())
            .finish()
    }
}

/// A mission that owns child missions.
#[derive(Clone)]
pub struct Operation(Mission);

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Mission::build(name.into()))
    }

    pub fn mission(&self) -> &Mission {
        &self.0
    }

    pub fn children(&self) -> Vec<Mission> {
        self.0.children_snapshot()
    }

    pub fn child_count(&self) -> usize {
        self.slots().borrow().len()
    }

    pub fn contains(&self, child: &Mission) -> bool {
        self.slots()
            .borrow()
            .iter()
            .any(|slot| slot.mission.ptr_eq(child))
    }

    /// Take ownership of `child`.
    ///
    /// The child is connected at once if this operation is connected, and
    /// aborted at once if this operation is aborted.
    pub fn take_mission(&self, child: &Mission) {
        if let Some(previous) = child.parent() {
            log::warn!(
                "mission({}): {} moved away from {}",
                self.name(),
                child.name(),
                previous.name()
            );
            previous.remove_mission(child);
        }
        *child.inner.parent.borrow_mut() = Rc::downgrade(&self.0.inner);

        let parent = Rc::downgrade(&self.0.inner);
        let listener = child.connect_abort(move |aborted| {
            let Some(inner) = parent.upgrade() else {
                return;
            };
            let parent = Operation(Mission { inner });
            if !parent.0.inner.cascading.get() {
                parent.remove_mission(aborted);
            }
        });
        self.slots().borrow_mut().push(ChildSlot {
            mission: child.clone(),
            listener,
        });
        log::trace!("mission({}): took {}", self.name(), child.name());

        if self.is_aborted() {
            let was_cascading = self.0.inner.cascading.replace(true);
            child.abort();
            self.0.inner.cascading.set(was_cascading);
        } else if self.is_connected() {
            child.connect();
        }
    }

    /// Detach and release `child`. Returns `false`, with a warning, if it is
    /// not one of this operation's children.
    pub fn remove_mission(&self, child: &Mission) -> bool {
        let slot = {
            let mut slots = self.slots().borrow_mut();
            slots
                .iter()
                .position(|slot| slot.mission.ptr_eq(child))
                .map(|index| slots.remove(index))
        };
        let Some(slot) = slot else {
            log::warn!("mission({}): {} is not a child", self.name(), child.name());
            return false;
        };
        slot.mission.disconnect_abort(slot.listener);
        *slot.mission.inner.parent.borrow_mut() = Weak::new();
        log::trace!("mission({}): removed {}", self.name(), child.name());
        drop(slot);
        true
    }

    fn slots(&self) -> &RefCell<Vec<ChildSlot>> {
        &self.0.inner.children
    }
}

impl Deref for Operation {
    type Target = Mission;

    fn deref(&self) -> &Mission {
        &self.0
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.0.inner.name)
            .field("connected", &self.0.inner.connected.get())
            .field("aborted", &self.0.inner.aborted.get())
            .field("children", &self.children())
            .finish()
    }
}
