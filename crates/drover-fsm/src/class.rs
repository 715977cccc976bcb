//! Machine class descriptors and tick priorities.
//!
//! A [`MachineClass`] is a plain record: name, state-name constraints,
//! a tick priority, and a callable registrar that attaches states to a
//! fresh machine. There is no runtime inheritance; specialization is
//! composition plus function pointers.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexSet;

use drover_core::{Clock, LogBuffer, MachineId};

use crate::machine::{ContextMap, StateMachine};

/// Tick priority: "run every N frames".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Every frame.
    Render,
    /// Every 2 frames.
    High,
    /// Every 5 frames.
    Medium,
    /// Every 10 frames.
    Low,
    /// Every 30 frames.
    Background,
    /// A custom frame interval.
    EveryFrames(u32),
}

impl Priority {
    /// The frame interval this priority ticks at.
    pub fn frames(self) -> u32 {
        match self {
            Self::Render => 1,
            Self::High => 2,
            Self::Medium => 5,
            Self::Low => 10,
            Self::Background => 30,
            Self::EveryFrames(n) => n.max(1),
        }
    }

    /// The tick period in seconds for a given frame duration.
    pub fn period_secs(self, frame_seconds: f64) -> f64 {
        f64::from(self.frames()) * frame_seconds
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Render
    }
}

/// Configuration for binding a sub-machine to a parent state.
#[derive(Clone, Debug)]
pub struct SubMachineConfig {
    /// The child's initial state.
    pub initial_state: String,
    /// Parent transition target when the child completes.
    pub on_completed: String,
    /// Parent transition target when the child fails.
    pub on_failed: String,
    /// Parent transition target when the child is cancelled, if any.
    pub on_cancelled: Option<String>,
    /// Context key under which the child's id is stored for the duration
    /// of the parent state.
    pub store_key: Option<String>,
}

impl SubMachineConfig {
    /// A binding with completion and failure routes.
    pub fn new(
        initial_state: impl Into<String>,
        on_completed: impl Into<String>,
        on_failed: impl Into<String>,
    ) -> Self {
        Self {
            initial_state: initial_state.into(),
            on_completed: on_completed.into(),
            on_failed: on_failed.into(),
            on_cancelled: None,
            store_key: None,
        }
    }

    /// Route child cancellation to a parent state.
    pub fn on_cancelled(mut self, target: impl Into<String>) -> Self {
        self.on_cancelled = Some(target.into());
        self
    }

    /// Store the child's id in the shared context under `key`.
    pub fn store_as(mut self, key: impl Into<String>) -> Self {
        self.store_key = Some(key.into());
        self
    }
}

/// A compiled machine class.
pub struct MachineClass {
    /// Class name, unique within a registry.
    pub class_name: String,
    /// If non-empty, every registered or targeted state must be a member.
    pub valid_states: Option<IndexSet<String>>,
    /// Entering any of these names stops the machine.
    pub terminal_states: IndexSet<String>,
    /// Tick interval.
    pub priority: Priority,
    /// Strict mode: reject transitions to terminal names that were never
    /// registered instead of silently terminating.
    pub reject_unregistered_terminals: bool,
    /// Attaches states, rules, and sub-machines to a fresh machine.
    pub register: Rc<dyn Fn(&mut StateMachine)>,
}

impl MachineClass {
    /// Start building a class.
    pub fn builder(class_name: impl Into<String>) -> MachineClassBuilder {
        MachineClassBuilder {
            class_name: class_name.into(),
            valid_states: None,
            terminal_states: IndexSet::new(),
            priority: Priority::default(),
            reject_unregistered_terminals: false,
            register: None,
        }
    }

    /// Construct and register a machine of this class.
    ///
    /// The `context` map is shared by reference: sub-machines of the new
    /// machine see the same map, and embedders may pre-seed it.
    pub fn instantiate(
        self: &Rc<Self>,
        machine_id: MachineId,
        context: Rc<RefCell<ContextMap>>,
        clock: Clock,
        log: LogBuffer,
    ) -> StateMachine {
        let mut machine = StateMachine::new(self.clone(), machine_id, context, clock, log);
        (self.register)(&mut machine);
        machine
    }
}

impl std::fmt::Debug for MachineClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineClass")
            .field("class_name", &self.class_name)
            .field("valid_states", &self.valid_states)
            .field("terminal_states", &self.terminal_states)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Builder for [`MachineClass`].
pub struct MachineClassBuilder {
    class_name: String,
    valid_states: Option<IndexSet<String>>,
    terminal_states: IndexSet<String>,
    priority: Priority,
    reject_unregistered_terminals: bool,
    register: Option<Rc<dyn Fn(&mut StateMachine)>>,
}

impl MachineClassBuilder {
    /// Constrain state names to the given set.
    pub fn valid_states<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.valid_states = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Declare terminal state names.
    pub fn terminal_states<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_states = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the tick priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject transitions to unregistered terminal names.
    pub fn strict_terminals(mut self) -> Self {
        self.reject_unregistered_terminals = true;
        self
    }

    /// Set the state registrar.
    pub fn register(mut self, f: impl Fn(&mut StateMachine) + 'static) -> Self {
        self.register = Some(Rc::new(f));
        self
    }

    /// Finish the class.
    pub fn build(self) -> Rc<MachineClass> {
        Rc::new(MachineClass {
            class_name: self.class_name,
            valid_states: self.valid_states,
            terminal_states: self.terminal_states,
            priority: self.priority,
            reject_unregistered_terminals: self.reject_unregistered_terminals,
            register: self.register.unwrap_or_else(|| Rc::new(|_| {})),
        })
    }
}
