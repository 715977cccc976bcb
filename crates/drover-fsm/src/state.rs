//! State definitions and the callback context.
//!
//! States come in two shapes: object states implementing [`State`], and
//! function states ([`StateFn`]) kept for compatibility with older
//! behavior code. Callbacks never touch the machine directly; they record
//! requests on a [`StateCtx`], which the machine applies after the
//! callback returns. This keeps dispatch non-re-entrant without losing
//! the ability to chain transitions.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use drover_core::{Args, MachineId, Value};

use crate::machine::ContextMap;

/// A captured state-callback failure.
///
/// Returned from `on_enter`/`on_heartbeat`; the machine logs it and
/// surfaces it as `fail(reason)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateFault {
    /// Human-readable description of the failure.
    pub reason: String,
}

impl StateFault {
    /// Build a fault from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StateFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for StateFault {}

/// An object state with explicit lifecycle callbacks.
///
/// All methods default to no-ops so states implement only what they use.
pub trait State {
    /// Called when the machine enters this state.
    fn on_enter(&mut self, ctx: &mut StateCtx, args: &Args) -> Result<(), StateFault> {
        let _ = (ctx, args);
        Ok(())
    }

    /// Called on each machine tick while this state is current, with the
    /// real time accumulated since the previous tick.
    fn on_heartbeat(&mut self, ctx: &mut StateCtx, dt: f64) -> Result<(), StateFault> {
        let _ = (ctx, dt);
        Ok(())
    }

    /// Called when the machine leaves this state.
    ///
    /// Transition requests recorded here are discarded; leave callbacks
    /// only release per-state resources.
    fn on_leave(&mut self, ctx: &mut StateCtx) {
        let _ = ctx;
    }
}

/// Teardown callable returned by a function state.
pub type Cleanup = Box<dyn FnOnce()>;

/// A function state body.
///
/// If it returns a [`Cleanup`], the machine invokes it **immediately
/// after the function returns** — not when the state is left. This
/// reproduces legacy behavior-script semantics; use an object state's
/// `on_leave` for per-transition cleanup.
pub type StateFn = Box<dyn FnMut(&mut StateCtx, &Args) -> Result<Option<Cleanup>, StateFault>>;

/// A registered state definition.
pub enum StateDef {
    /// A function state. See [`StateFn`] for the cleanup quirk.
    Function(StateFn),
    /// An object state.
    Object(Box<dyn State>),
}

impl StateDef {
    /// Wrap a function state.
    pub fn function(
        f: impl FnMut(&mut StateCtx, &Args) -> Result<Option<Cleanup>, StateFault> + 'static,
    ) -> Self {
        Self::Function(Box::new(f))
    }

    /// Wrap an object state.
    pub fn object(state: impl State + 'static) -> Self {
        Self::Object(Box::new(state))
    }
}

impl fmt::Debug for StateDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function"),
            Self::Object(_) => f.write_str("Object"),
        }
    }
}

/// A declarative transition evaluated on each tick.
///
/// Rules run after `on_heartbeat`, in registration order; the first
/// condition returning true triggers a transition to its target.
pub struct TransitionRule {
    /// The transition target.
    pub target: String,
    /// The predicate, given the callback context and accumulated `dt`.
    pub condition: Box<dyn Fn(&StateCtx, f64) -> bool>,
}

/// Lifecycle request recorded by a callback.
#[derive(Debug)]
pub(crate) enum LifecycleReq {
    Finish,
    Fail(String),
    Cancel,
}

/// Requests accumulated during one callback invocation.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub transition: Option<(String, Args)>,
    pub wait_span: Option<f64>,
    pub lifecycle: Option<LifecycleReq>,
}

/// A state callback's window into its machine.
///
/// Everything a callback may do to the machine goes through here and is
/// applied after the callback returns: the last transition request wins,
/// a wait span defers the next transition, and lifecycle requests
/// (finish/fail/cancel) take precedence over transitions.
pub struct StateCtx<'a> {
    machine_id: MachineId,
    state: Option<String>,
    context: Rc<RefCell<ContextMap>>,
    elapsed: f64,
    effects: &'a mut Effects,
}

impl<'a> StateCtx<'a> {
    pub(crate) fn new(
        machine_id: MachineId,
        state: Option<String>,
        context: Rc<RefCell<ContextMap>>,
        elapsed: f64,
        effects: &'a mut Effects,
    ) -> Self {
        Self {
            machine_id,
            state,
            context,
            elapsed,
            effects,
        }
    }

    /// The machine's id.
    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// The current state name, if any.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Seconds spent in the current state so far.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Request a transition with no arguments.
    pub fn goto(&mut self, target: impl Into<String>) {
        self.effects.transition = Some((target.into(), Args::new()));
    }

    /// Request a transition with arguments.
    pub fn goto_with(&mut self, target: impl Into<String>, args: Args) {
        self.effects.transition = Some((target.into(), args));
    }

    /// Defer the machine's next transition by `secs`.
    ///
    /// The span is consumed atomically by the next transition request;
    /// any transition requested after that invalidates the deferred one.
    pub fn set_wait_span(&mut self, secs: f64) {
        self.effects.wait_span = Some(secs.max(0.0));
    }

    /// Request completion of the machine.
    pub fn finish(&mut self) {
        self.effects.lifecycle = Some(LifecycleReq::Finish);
    }

    /// Request failure of the machine.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.effects.lifecycle = Some(LifecycleReq::Fail(reason.into()));
    }

    /// Request cancellation of the machine.
    pub fn cancel(&mut self) {
        self.effects.lifecycle = Some(LifecycleReq::Cancel);
    }

    /// Read a context slot.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.context.borrow().get(key).cloned()
    }

    /// Write a context slot.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.context.borrow_mut().insert(key.into(), value);
    }

    /// Remove a context slot, returning its value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.context.borrow_mut().shift_remove(key)
    }
}
