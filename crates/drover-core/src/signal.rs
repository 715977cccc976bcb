//! Local multicast signals with connect/once/fire semantics.
//!
//! [`Signal`] is the event primitive connecting entities, machines, and
//! the runtime. Handlers run on the runtime's single logical thread in
//! connection order. A `fire` issued from inside a handler is queued and
//! delivered after the current dispatch completes, so handler stacks
//! never re-enter.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

type Callback<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Handler<T> {
    id: u64,
    once: bool,
    alive: Rc<Cell<bool>>,
    callback: Callback<T>,
}

struct Inner<T> {
    handlers: Vec<Handler<T>>,
    queued: VecDeque<T>,
    next_id: u64,
    firing: bool,
}

/// A handle to a connected signal handler.
///
/// `disconnect()` is idempotent and honored even mid-dispatch: a handler
/// disconnected while a fire is in flight will not run again. Dropping a
/// `Connection` does **not** disconnect; pair it with a managed-resource
/// list when automatic teardown is wanted.
#[derive(Clone)]
pub struct Connection {
    alive: Rc<Cell<bool>>,
    id: u64,
}

impl Connection {
    /// Stop the handler from receiving further fires.
    pub fn disconnect(&self) {
        self.alive.set(false);
    }

    /// Whether the handler is still connected.
    pub fn is_connected(&self) -> bool {
        self.alive.get()
    }

    /// Stable id of the underlying handler, for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A local multicast event.
///
/// Cloning a `Signal` clones the handle, not the handler list; all clones
/// fire the same set of handlers.
///
/// # Examples
///
/// ```
/// use drover_core::Signal;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let sig: Signal<u32> = Signal::new();
/// let seen = Rc::new(Cell::new(0));
/// let seen2 = seen.clone();
/// sig.connect(move |v| seen2.set(seen2.get() + *v));
/// sig.fire(3);
/// sig.fire(4);
/// assert_eq!(seen.get(), 7);
/// ```
pub struct Signal<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    /// Create a signal with no handlers.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                handlers: Vec::new(),
                queued: VecDeque::new(),
                next_id: 0,
                firing: false,
            })),
        }
    }

    fn attach(&self, once: bool, callback: impl FnMut(&T) + 'static) -> Connection {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let alive = Rc::new(Cell::new(true));
        inner.handlers.push(Handler {
            id,
            once,
            alive: alive.clone(),
            callback: Rc::new(RefCell::new(callback)),
        });
        Connection { alive, id }
    }

    /// Connect a handler that runs on every fire until disconnected.
    pub fn connect(&self, callback: impl FnMut(&T) + 'static) -> Connection {
        self.attach(false, callback)
    }

    /// Connect a handler that runs on the next fire only.
    pub fn once(&self, callback: impl FnMut(&T) + 'static) -> Connection {
        self.attach(true, callback)
    }

    /// Number of currently connected handlers.
    pub fn connection_count(&self) -> usize {
        self.inner
            .borrow()
            .handlers
            .iter()
            .filter(|h| h.alive.get())
            .count()
    }

    /// Disconnect every handler.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        for h in &inner.handlers {
            h.alive.set(false);
        }
        inner.handlers.clear();
    }

    /// Fire the signal, delivering `value` to each connected handler in
    /// connection order.
    ///
    /// A fire issued while a dispatch is already running (from inside a
    /// handler) is queued and delivered after the current value finishes.
    pub fn fire(&self, value: T) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.queued.push_back(value);
            if inner.firing {
                return;
            }
            inner.firing = true;
        }

        loop {
            let next = self.inner.borrow_mut().queued.pop_front();
            let Some(value) = next else { break };

            // Snapshot the handler list so callbacks are free to connect,
            // disconnect, or fire without holding the inner borrow.
            let snapshot: Vec<(bool, Rc<Cell<bool>>, Callback<T>)> = {
                let inner = self.inner.borrow();
                inner
                    .handlers
                    .iter()
                    .filter(|h| h.alive.get())
                    .map(|h| (h.once, h.alive.clone(), h.callback.clone()))
                    .collect()
            };

            for (once, alive, callback) in snapshot {
                if !alive.get() {
                    continue;
                }
                if once {
                    alive.set(false);
                }
                (callback.borrow_mut())(&value);
            }

            self.inner
                .borrow_mut()
                .handlers
                .retain(|h| h.alive.get());
        }

        self.inner.borrow_mut().firing = false;
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// Create a one-shot waiter for the next fire.
    ///
    /// The waiter captures the next fired value; poll it with
    /// [`Waiter::try_take`]. This is the building block for
    /// wait-with-timeout at the runtime layer, where the timeout side is a
    /// scheduled task rather than a blocking call.
    pub fn waiter(&self) -> Waiter<T> {
        let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let connection = self.once(move |v: &T| {
            *slot2.borrow_mut() = Some(v.clone());
        });
        Waiter { slot, connection }
    }
}

/// Captures the next value fired on a [`Signal`].
pub struct Waiter<T> {
    slot: Rc<RefCell<Option<T>>>,
    connection: Connection,
}

impl<T> Waiter<T> {
    /// Take the captured value, if the signal has fired.
    pub fn try_take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }

    /// Stop waiting; the slot will never fill after this.
    pub fn cancel(&self) {
        self.connection.disconnect();
    }
}
