//! The state machine runtime.
//!
//! A [`StateMachine`] owns its state registry and shared context, and is
//! ticked externally (by a scheduler task) at its class priority. All
//! callback-requested work is applied after the callback returns, and an
//! active sub-machine routes its lifecycle signals into parent
//! transitions through a request queue, so dispatch never re-enters.
//!
//! Lifecycle signal handlers must not call back into the machine
//! synchronously (the machine is mutably borrowed while firing); push
//! work onto a queue and apply it from your own tick, as the sub-machine
//! bridge does.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use drover_core::{Args, Disposable, LogBuffer, MachineId, Signal, TransitionError, Value};
use drover_core::Clock;

use crate::class::{MachineClass, SubMachineConfig};
use crate::state::{Cleanup, Effects, LifecycleReq, StateCtx, StateDef, TransitionRule};

/// The machine's shared key/value context.
///
/// Sub-machines share the parent's map by reference; cross-references
/// between machines and entities travel through it as ids, never as
/// strong links.
pub type ContextMap = IndexMap<String, Value>;

/// Machine lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Constructed but not started.
    Idle,
    /// Started and ticking.
    Running,
    /// Terminated via `finish()`.
    Finished,
    /// Terminated via `fail(reason)`.
    Failed,
    /// Terminated via `cancel()`.
    Cancelled,
    /// Destroyed; resources released.
    Destroyed,
}

/// Payload of the `state_changed` signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    /// The state being entered.
    pub new: String,
    /// The state being left, if any.
    pub old: Option<String>,
}

/// Serializable view of a machine for service snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineView {
    /// Machine id.
    pub machine_id: MachineId,
    /// Class name.
    pub class_name: String,
    /// Current state, if started.
    pub state: Option<String>,
    /// Previous state, if any.
    pub previous_state: Option<String>,
    /// Lifecycle phase.
    pub run_state: RunState,
    /// Tick interval in frames.
    pub priority_frames: u32,
}

struct StateSlot {
    def: StateDef,
    valid_outcomes: Option<IndexSet<String>>,
    rules: Vec<TransitionRule>,
}

struct SubBinding {
    child_class: Rc<MachineClass>,
    config: SubMachineConfig,
}

struct Deferred {
    token: u64,
    target: String,
    args: Args,
    due_us: u64,
}

/// A hierarchical state machine instance.
pub struct StateMachine {
    class: Rc<MachineClass>,
    machine_id: MachineId,
    state: Option<String>,
    previous_state: Option<String>,
    context: Rc<RefCell<ContextMap>>,
    states: IndexMap<String, StateSlot>,
    subs: IndexMap<String, SubBinding>,
    wait_span: f64,
    deferred: Option<Deferred>,
    defer_token: u64,
    entered_at_us: u64,
    run_state: RunState,
    managed: Vec<Disposable>,
    active_child: Option<Rc<RefCell<StateMachine>>>,
    /// Parent transition requests pushed by child lifecycle handlers;
    /// the first request per tick wins, the rest are dropped.
    sub_requests: Rc<RefCell<Vec<(String, Args)>>>,
    /// Fires once when the machine finishes.
    pub completed: Signal<()>,
    /// Fires once with the reason when the machine fails.
    pub failed: Signal<String>,
    /// Fires once when the machine is cancelled.
    pub cancelled: Signal<()>,
    /// Fires on every applied transition, terminal included.
    pub state_changed: Signal<StateChange>,
    clock: Clock,
    log: LogBuffer,
}

impl StateMachine {
    /// Construct an unstarted machine of the given class.
    ///
    /// Normally called through [`MachineClass::instantiate`], which also
    /// runs the class registrar.
    pub fn new(
        class: Rc<MachineClass>,
        machine_id: MachineId,
        context: Rc<RefCell<ContextMap>>,
        clock: Clock,
        log: LogBuffer,
    ) -> Self {
        Self {
            class,
            machine_id,
            state: None,
            previous_state: None,
            context,
            states: IndexMap::new(),
            subs: IndexMap::new(),
            wait_span: 0.0,
            deferred: None,
            defer_token: 0,
            entered_at_us: 0,
            run_state: RunState::Idle,
            managed: Vec::new(),
            active_child: None,
            sub_requests: Rc::new(RefCell::new(Vec::new())),
            completed: Signal::new(),
            failed: Signal::new(),
            cancelled: Signal::new(),
            state_changed: Signal::new(),
            clock,
            log,
        }
    }

    // ── Accessors ───────────────────────────────────────────────

    /// The machine's id.
    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// The machine's class name.
    pub fn class_name(&self) -> &str {
        &self.class.class_name
    }

    /// The machine's class.
    pub fn class(&self) -> &Rc<MachineClass> {
        &self.class
    }

    /// Current state name, if started.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Previous state name, if any transition has occurred.
    pub fn previous_state(&self) -> Option<&str> {
        self.previous_state.as_deref()
    }

    /// Lifecycle phase.
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Whether the machine is started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.run_state == RunState::Running
    }

    /// Handle to the shared context map.
    pub fn context(&self) -> Rc<RefCell<ContextMap>> {
        self.context.clone()
    }

    /// Read a context slot.
    pub fn context_get(&self, key: &str) -> Option<Value> {
        self.context.borrow().get(key).cloned()
    }

    /// Write a context slot.
    pub fn context_set(&self, key: impl Into<String>, value: Value) {
        self.context.borrow_mut().insert(key.into(), value);
    }

    /// Seconds spent in the current state.
    pub fn elapsed(&self) -> f64 {
        (self.clock.now_us().saturating_sub(self.entered_at_us)) as f64 / 1_000_000.0
    }

    /// Serializable view for service snapshots.
    pub fn view(&self) -> MachineView {
        MachineView {
            machine_id: self.machine_id.clone(),
            class_name: self.class.class_name.clone(),
            state: self.state.clone(),
            previous_state: self.previous_state.clone(),
            run_state: self.run_state,
            priority_frames: self.class.priority.frames(),
        }
    }

    // ── Registration ────────────────────────────────────────────

    /// Register a state.
    pub fn add_state(&mut self, name: impl Into<String>, def: StateDef) -> Result<(), TransitionError> {
        self.add_state_with_outcomes(name, def, None::<[&str; 0]>)
    }

    /// Register a state constraining which targets it may transition to.
    pub fn add_state_with_outcomes<I, S>(
        &mut self,
        name: impl Into<String>,
        def: StateDef,
        valid_outcomes: Option<I>,
    ) -> Result<(), TransitionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        self.check_state_name(&name)?;
        self.states.insert(
            name,
            StateSlot {
                def,
                valid_outcomes: valid_outcomes.map(|i| i.into_iter().map(Into::into).collect()),
                rules: Vec::new(),
            },
        );
        Ok(())
    }

    /// Attach a declarative transition rule to a registered state.
    ///
    /// Rules are evaluated in registration order after each heartbeat;
    /// the first condition returning true wins.
    pub fn add_transition(
        &mut self,
        state: &str,
        target: impl Into<String>,
        condition: impl Fn(&StateCtx, f64) -> bool + 'static,
    ) -> Result<(), TransitionError> {
        let slot = self
            .states
            .get_mut(state)
            .ok_or_else(|| TransitionError::UnknownState {
                name: state.to_string(),
            })?;
        slot.rules.push(TransitionRule {
            target: target.into(),
            condition: Box::new(condition),
        });
        Ok(())
    }

    /// Bind a sub-machine to a state.
    ///
    /// Entering the state constructs a child of `child_class` sharing
    /// this machine's context, starts it at the configured initial
    /// state, and routes its lifecycle signals to parent transitions.
    /// Leaving the state cancels and destroys the child.
    pub fn add_sub_machine(
        &mut self,
        name: impl Into<String>,
        child_class: Rc<MachineClass>,
        config: SubMachineConfig,
    ) -> Result<(), TransitionError> {
        let name = name.into();
        self.check_state_name(&name)?;
        self.subs.insert(
            name,
            SubBinding {
                child_class,
                config,
            },
        );
        Ok(())
    }

    fn check_state_name(&self, name: &str) -> Result<(), TransitionError> {
        if let Some(valid) = &self.class.valid_states {
            if !valid.contains(name) {
                self.log.error(
                    Some(self.machine_id.as_str()),
                    format!("state '{name}' is outside the valid-state set"),
                );
                return Err(TransitionError::NotAllowed {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Register a disposable released (LIFO) on destruction.
    pub fn manage(&mut self, disposable: impl Into<Disposable>) {
        self.managed.push(disposable.into());
    }

    /// Defer the next transition by `secs`.
    pub fn set_wait_span(&mut self, secs: f64) {
        self.wait_span = secs.max(0.0);
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Start the machine at the given initial state.
    pub fn start(&mut self, initial: &str, args: Args) -> Result<(), TransitionError> {
        if self.run_state != RunState::Idle {
            return Err(TransitionError::MachineStopped);
        }
        self.run_state = RunState::Running;
        let result = self.apply_transition(initial, args);
        if result.is_err() {
            self.run_state = RunState::Idle;
        }
        result
    }

    /// Transition to `target`.
    ///
    /// If a wait span is pending, the transition is deferred instead and
    /// applied on a later tick — unless a newer transition invalidates
    /// it first. The span is consumed atomically.
    pub fn change_state(&mut self, target: &str, args: Args) -> Result<(), TransitionError> {
        if !self.is_running() {
            self.log.warn(
                Some(self.machine_id.as_str()),
                format!("transition to '{target}' on a stopped machine"),
            );
            return Err(TransitionError::MachineStopped);
        }
        if self.wait_span > 0.0 {
            let span = self.wait_span;
            self.wait_span = 0.0;
            self.defer_token += 1;
            self.deferred = Some(Deferred {
                token: self.defer_token,
                target: target.to_string(),
                args,
                due_us: self.clock.now_us() + (span * 1_000_000.0) as u64,
            });
            return Ok(());
        }
        self.apply_transition(target, args)
    }

    fn apply_transition(&mut self, target: &str, args: Args) -> Result<(), TransitionError> {
        if !self.is_running() {
            return Err(TransitionError::MachineStopped);
        }

        // Any applied transition invalidates a pending deferred one.
        self.defer_token += 1;
        self.deferred = None;

        let op = self.machine_id.0.clone();
        let is_terminal = self.class.terminal_states.contains(target);
        let registered = self.states.contains_key(target) || self.subs.contains_key(target);

        if let Some(valid) = &self.class.valid_states {
            if !valid.contains(target) {
                self.log
                    .error(Some(op.as_str()), format!("transition target '{target}' is outside the valid-state set"));
                return Err(TransitionError::NotAllowed {
                    name: target.to_string(),
                });
            }
        }
        if let Some(cur) = &self.state {
            if let Some(slot) = self.states.get(cur) {
                if let Some(outcomes) = &slot.valid_outcomes {
                    if !outcomes.contains(target) {
                        self.log.error(
                            Some(op.as_str()),
                            format!("'{target}' is not a valid outcome of '{cur}'"),
                        );
                        return Err(TransitionError::IllegalOutcome {
                            from: cur.clone(),
                            to: target.to_string(),
                        });
                    }
                }
            }
        }
        if !registered && (!is_terminal || self.class.reject_unregistered_terminals) {
            self.log
                .error(Some(op.as_str()), format!("transition to unknown state '{target}'"));
            return Err(TransitionError::UnknownState {
                name: target.to_string(),
            });
        }

        // Leave the current state: tear down a bound child first, then
        // run on_leave. Requests recorded by on_leave are discarded.
        if let Some(cur) = self.state.clone() {
            if self.subs.contains_key(&cur) {
                self.teardown_child(Some(cur.as_str()));
            }
            let elapsed = self.elapsed();
            if let Some(slot) = self.states.get_mut(&cur) {
                if let StateDef::Object(obj) = &mut slot.def {
                    let mut discarded = Effects::default();
                    let mut ctx = StateCtx::new(
                        self.machine_id.clone(),
                        Some(cur.clone()),
                        self.context.clone(),
                        elapsed,
                        &mut discarded,
                    );
                    obj.on_leave(&mut ctx);
                }
            }
        }

        self.previous_state = self.state.take();
        self.state = Some(target.to_string());
        self.entered_at_us = self.clock.now_us();
        self.state_changed.fire(StateChange {
            new: target.to_string(),
            old: self.previous_state.clone(),
        });

        if is_terminal {
            match target {
                "Failed" => {
                    let reason = args
                        .first()
                        .and_then(Value::as_text)
                        .unwrap_or("unspecified")
                        .to_string();
                    self.fail(reason);
                }
                "Cancelled" => self.cancel(),
                _ => self.finish(),
            }
            return Ok(());
        }

        if self.subs.contains_key(target) {
            self.spawn_child(target);
            return Ok(());
        }

        // Enter a registered state.
        let mut effects = Effects::default();
        let mut fault = None;
        let mut cleanup: Option<Cleanup> = None;
        if let Some(slot) = self.states.get_mut(target) {
            let mut ctx = StateCtx::new(
                self.machine_id.clone(),
                Some(target.to_string()),
                self.context.clone(),
                0.0,
                &mut effects,
            );
            match &mut slot.def {
                StateDef::Object(obj) => {
                    if let Err(e) = obj.on_enter(&mut ctx, &args) {
                        fault = Some(e);
                    }
                }
                StateDef::Function(f) => match f(&mut ctx, &args) {
                    Ok(c) => cleanup = c,
                    Err(e) => fault = Some(e),
                },
            }
        }
        // Function-state cleanup runs right away, by long-standing
        // contract; per-transition cleanup belongs in object states.
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        if let Some(fault) = fault {
            self.log.error(
                Some(op.as_str()),
                format!("entering '{target}' failed: {fault}"),
            );
            self.fail(fault.reason);
            return Ok(());
        }
        self.apply_effects(effects);
        Ok(())
    }

    fn apply_effects(&mut self, effects: Effects) {
        if let Some(span) = effects.wait_span {
            self.wait_span = span;
        }
        match effects.lifecycle {
            Some(LifecycleReq::Finish) => return self.finish(),
            Some(LifecycleReq::Fail(reason)) => return self.fail(reason),
            Some(LifecycleReq::Cancel) => return self.cancel(),
            None => {}
        }
        if let Some((target, args)) = effects.transition {
            let _ = self.change_state(&target, args);
        }
    }

    /// Drive the machine by `dt` seconds of accumulated real time.
    ///
    /// Applies a due deferred transition, ticks the active sub-machine
    /// and routes its lifecycle, runs the current state's heartbeat, and
    /// evaluates declarative transition rules.
    pub fn tick(&mut self, dt: f64) {
        if !self.is_running() {
            return;
        }

        // 1. Deferred transition, if due and still current.
        if let Some(d) = &self.deferred {
            if d.token != self.defer_token {
                self.deferred = None;
            } else if self.clock.now_us() >= d.due_us {
                let d = self.deferred.take().expect("checked above");
                let _ = self.apply_transition(&d.target, d.args);
                if !self.is_running() {
                    return;
                }
            }
        }

        // 2. Tick the active child, then apply the first routed request.
        if let Some(child) = self.active_child.clone() {
            child.borrow_mut().tick(dt);
        }
        let request = {
            let mut queue = self.sub_requests.borrow_mut();
            let first = queue.drain(..).next();
            first
        };
        if let Some((target, args)) = request {
            let _ = self.change_state(&target, args);
            if !self.is_running() {
                return;
            }
        }

        // 3. Heartbeat the current state.
        let Some(cur) = self.state.clone() else {
            return;
        };
        let elapsed = self.elapsed();
        let mut effects = Effects::default();
        let mut fault = None;
        if let Some(slot) = self.states.get_mut(&cur) {
            if let StateDef::Object(obj) = &mut slot.def {
                let mut ctx = StateCtx::new(
                    self.machine_id.clone(),
                    Some(cur.clone()),
                    self.context.clone(),
                    elapsed,
                    &mut effects,
                );
                if let Err(e) = obj.on_heartbeat(&mut ctx, dt) {
                    fault = Some(e);
                }
            }
        }
        if let Some(fault) = fault {
            self.log.error(
                Some(self.machine_id.as_str()),
                format!("heartbeat in '{cur}' failed: {fault}"),
            );
            self.fail(fault.reason);
            return;
        }
        self.apply_effects(effects);
        if !self.is_running() {
            return;
        }

        // 4. Declarative rules, unless the heartbeat already moved on.
        if self.state.as_deref() == Some(cur.as_str()) {
            let mut chosen: Option<String> = None;
            {
                let mut probe = Effects::default();
                let ctx = StateCtx::new(
                    self.machine_id.clone(),
                    Some(cur.clone()),
                    self.context.clone(),
                    elapsed,
                    &mut probe,
                );
                if let Some(slot) = self.states.get(&cur) {
                    for rule in &slot.rules {
                        if (rule.condition)(&ctx, dt) {
                            chosen = Some(rule.target.clone());
                            break;
                        }
                    }
                }
            }
            if let Some(target) = chosen {
                let _ = self.change_state(&target, Args::new());
            }
        }
    }

    /// Stop the machine successfully. Fires `completed` once.
    pub fn finish(&mut self) {
        if !self.is_running() {
            return;
        }
        self.teardown_child(self.state.clone().as_deref());
        self.run_state = RunState::Finished;
        self.completed.fire(());
    }

    /// Stop the machine with a failure reason. Fires `failed` once.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.is_running() {
            return;
        }
        self.teardown_child(self.state.clone().as_deref());
        self.run_state = RunState::Failed;
        self.failed.fire(reason.into());
    }

    /// Stop the machine cooperatively. Fires `cancelled` once.
    pub fn cancel(&mut self) {
        if !self.is_running() {
            return;
        }
        self.teardown_child(self.state.clone().as_deref());
        self.run_state = RunState::Cancelled;
        self.cancelled.fire(());
    }

    /// Release all resources. Idempotent.
    ///
    /// A still-running machine is cancelled first. Managed disposables
    /// are released in LIFO order.
    pub fn destroy(&mut self) {
        if self.run_state == RunState::Destroyed {
            return;
        }
        if self.is_running() {
            self.cancel();
        }
        self.teardown_child(self.state.clone().as_deref());
        for disposable in self.managed.drain(..).rev() {
            disposable.dispose();
        }
        self.states.clear();
        self.subs.clear();
        self.completed.clear();
        self.failed.clear();
        self.cancelled.clear();
        self.state_changed.clear();
        self.run_state = RunState::Destroyed;
    }

    // ── Sub-machines ────────────────────────────────────────────

    fn spawn_child(&mut self, state_name: &str) {
        let Some(binding) = self.subs.get(state_name) else {
            return;
        };
        let class = binding.child_class.clone();
        let config = binding.config.clone();

        let child_id = MachineId(format!("{}:{}", self.machine_id, state_name));
        let mut child = class.instantiate(
            child_id.clone(),
            self.context.clone(),
            self.clock.clone(),
            self.log.clone(),
        );

        // Route child lifecycle into parent transition requests. The
        // handlers capture only the queue, never the parent.
        let queue = self.sub_requests.clone();
        let on_completed = config.on_completed.clone();
        child.completed.connect(move |_| {
            queue.borrow_mut().push((on_completed.clone(), Args::new()));
        });
        let queue = self.sub_requests.clone();
        let on_failed = config.on_failed.clone();
        child.failed.connect(move |reason: &String| {
            let mut args = Args::new();
            args.push(Value::Text(reason.clone()));
            queue.borrow_mut().push((on_failed.clone(), args));
        });
        if let Some(on_cancelled) = config.on_cancelled.clone() {
            let queue = self.sub_requests.clone();
            child.cancelled.connect(move |_| {
                queue.borrow_mut().push((on_cancelled.clone(), Args::new()));
            });
        }

        if let Some(key) = &config.store_key {
            self.context
                .borrow_mut()
                .insert(key.clone(), Value::Text(child_id.0.clone()));
        }

        if let Err(e) = child.start(&config.initial_state, Args::new()) {
            self.log.error(
                Some(self.machine_id.as_str()),
                format!("sub-machine for '{state_name}' failed to start: {e}"),
            );
            self.sub_requests.borrow_mut().push((
                config.on_failed.clone(),
                Args::from_iter([Value::Text(e.to_string())]),
            ));
        }
        self.active_child = Some(Rc::new(RefCell::new(child)));
    }

    fn teardown_child(&mut self, state_name: Option<&str>) {
        if let Some(child) = self.active_child.take() {
            let mut child = child.borrow_mut();
            child.cancel();
            child.destroy();
        }
        if let Some(name) = state_name {
            if let Some(binding) = self.subs.get(name) {
                if let Some(key) = &binding.config.store_key {
                    self.context.borrow_mut().shift_remove(key);
                }
            }
        }
        // Requests routed from the departed child no longer apply.
        self.sub_requests.borrow_mut().clear();
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Priority;
    use crate::state::{State, StateFault};
    use drover_core::ManualClock;
    use std::cell::Cell;

    fn harness(class: Rc<MachineClass>) -> (StateMachine, ManualClock) {
        let (clock, driver) = Clock::manual();
        let machine = class.instantiate(
            MachineId::from("m1"),
            Rc::new(RefCell::new(ContextMap::new())),
            clock,
            LogBuffer::new(64),
        );
        (machine, driver)
    }

    fn abc_class() -> Rc<MachineClass> {
        MachineClass::builder("Abc")
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
                m.add_state("B", StateDef::object(Noop)).unwrap();
                m.add_state("C", StateDef::object(Noop)).unwrap();
            })
            .build()
    }

    struct Noop;
    impl State for Noop {}

    fn changes(machine: &StateMachine) -> Rc<RefCell<Vec<(String, Option<String>)>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        machine.state_changed.connect(move |c: &StateChange| {
            log2.borrow_mut().push((c.new.clone(), c.old.clone()));
        });
        log
    }

    #[test]
    fn start_enters_initial_state() {
        let (mut m, _driver) = harness(abc_class());
        let log = changes(&m);
        m.start("A", Args::new()).unwrap();
        assert_eq!(m.state(), Some("A"));
        assert_eq!(m.run_state(), RunState::Running);
        assert_eq!(*log.borrow(), vec![("A".to_string(), None)]);
    }

    #[test]
    fn start_twice_is_rejected() {
        let (mut m, _driver) = harness(abc_class());
        m.start("A", Args::new()).unwrap();
        match m.start("B", Args::new()) {
            Err(TransitionError::MachineStopped) => {}
            other => panic!("expected MachineStopped, got {other:?}"),
        }
    }

    #[test]
    fn unknown_target_rejected_and_state_unchanged() {
        let (mut m, _driver) = harness(abc_class());
        m.start("A", Args::new()).unwrap();
        match m.change_state("Zzz", Args::new()) {
            Err(TransitionError::UnknownState { name }) => assert_eq!(name, "Zzz"),
            other => panic!("expected UnknownState, got {other:?}"),
        }
        assert_eq!(m.state(), Some("A"));
    }

    #[test]
    fn valid_states_constrain_targets() {
        let class = MachineClass::builder("Narrow")
            .valid_states(["A", "B"])
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
                m.add_state("B", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class.clone());
        m.start("A", Args::new()).unwrap();
        // Registering a state outside the set is also rejected.
        match m.add_state("C", StateDef::object(Noop)) {
            Err(TransitionError::NotAllowed { name }) => assert_eq!(name, "C"),
            other => panic!("expected NotAllowed, got {other:?}"),
        }
        match m.change_state("C", Args::new()) {
            Err(TransitionError::NotAllowed { .. }) => {}
            other => panic!("expected NotAllowed, got {other:?}"),
        }
        assert_eq!(m.state(), Some("A"));
    }

    #[test]
    fn valid_outcomes_gate_departures() {
        let class = MachineClass::builder("Gated")
            .register(|m| {
                m.add_state_with_outcomes("A", StateDef::object(Noop), Some(["B"]))
                    .unwrap();
                m.add_state("B", StateDef::object(Noop)).unwrap();
                m.add_state("C", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        match m.change_state("C", Args::new()) {
            Err(TransitionError::IllegalOutcome { from, to }) => {
                assert_eq!(from, "A");
                assert_eq!(to, "C");
            }
            other => panic!("expected IllegalOutcome, got {other:?}"),
        }
        m.change_state("B", Args::new()).unwrap();
        assert_eq!(m.state(), Some("B"));
        assert_eq!(m.previous_state(), Some("A"));
    }

    #[test]
    fn on_leave_precedes_on_enter() {
        struct Tracker {
            label: &'static str,
            log: Rc<RefCell<Vec<String>>>,
        }
        impl State for Tracker {
            fn on_enter(&mut self, _ctx: &mut StateCtx, _args: &Args) -> Result<(), StateFault> {
                self.log.borrow_mut().push(format!("enter {}", self.label));
                Ok(())
            }
            fn on_leave(&mut self, _ctx: &mut StateCtx) {
                self.log.borrow_mut().push(format!("leave {}", self.label));
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let log_a = log.clone();
        let log_b = log.clone();
        let class = MachineClass::builder("Order")
            .register(move |m| {
                m.add_state(
                    "A",
                    StateDef::object(Tracker {
                        label: "A",
                        log: log_a.clone(),
                    }),
                )
                .unwrap();
                m.add_state(
                    "B",
                    StateDef::object(Tracker {
                        label: "B",
                        log: log_b.clone(),
                    }),
                )
                .unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        m.change_state("B", Args::new()).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["enter A".to_string(), "leave A".into(), "enter B".into()]
        );
    }

    #[test]
    fn function_state_cleanup_runs_immediately() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let order_fn = order.clone();
        let class = MachineClass::builder("Legacy")
            .register(move |m| {
                let order = order_fn.clone();
                m.add_state(
                    "A",
                    StateDef::function(move |_ctx, _args| {
                        order.borrow_mut().push("body");
                        let order2 = order.clone();
                        Ok(Some(Box::new(move || {
                            order2.borrow_mut().push("cleanup");
                        }) as Cleanup))
                    }),
                )
                .unwrap();
                m.add_state("B", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        // The cleanup ran right after the body, before any leave.
        assert_eq!(*order.borrow(), vec!["body".to_string(), "cleanup".into()]);
        m.change_state("B", Args::new()).unwrap();
        assert_eq!(order.borrow().len(), 2);
    }

    #[test]
    fn wait_span_defers_and_newer_transition_invalidates() {
        let (mut m, driver) = harness(abc_class());
        let log = changes(&m);
        m.start("A", Args::new()).unwrap();

        m.set_wait_span(1.0);
        m.change_state("B", Args::new()).unwrap();
        assert_eq!(m.state(), Some("A"), "deferred transition applied early");
        // A newer transition invalidates the deferred one.
        m.change_state("C", Args::new()).unwrap();
        assert_eq!(m.state(), Some("C"));

        driver.advance_secs(1.5);
        m.tick(1.5);
        assert_eq!(m.state(), Some("C"), "invalidated deferral was applied");
        // Exactly two changes: A (start) and C.
        assert_eq!(
            *log.borrow(),
            vec![("A".to_string(), None), ("C".to_string(), Some("A".into()))]
        );
    }

    #[test]
    fn deferred_transition_applies_when_due() {
        let (mut m, driver) = harness(abc_class());
        m.start("A", Args::new()).unwrap();
        m.set_wait_span(1.0);
        m.change_state("B", Args::new()).unwrap();

        driver.advance_secs(0.5);
        m.tick(0.5);
        assert_eq!(m.state(), Some("A"));

        driver.advance_secs(0.6);
        m.tick(0.6);
        assert_eq!(m.state(), Some("B"));
    }

    #[test]
    fn terminal_state_fires_completed_and_stops() {
        let class = MachineClass::builder("Finishes")
            .terminal_states(["Done"])
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        let log = changes(&m);
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        m.completed.connect(move |_| done2.set(true));

        m.start("A", Args::new()).unwrap();
        // "Done" was never registered, but entering it still terminates.
        m.change_state("Done", Args::new()).unwrap();
        assert!(done.get());
        assert_eq!(m.run_state(), RunState::Finished);
        assert_eq!(log.borrow().last().unwrap().0, "Done");

        // Terminal finality: no further transitions or signals.
        match m.change_state("A", Args::new()) {
            Err(TransitionError::MachineStopped) => {}
            other => panic!("expected MachineStopped, got {other:?}"),
        }
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn strict_mode_rejects_unregistered_terminals() {
        let class = MachineClass::builder("Strict")
            .terminal_states(["Done"])
            .strict_terminals()
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        match m.change_state("Done", Args::new()) {
            Err(TransitionError::UnknownState { name }) => assert_eq!(name, "Done"),
            other => panic!("expected UnknownState, got {other:?}"),
        }
        assert!(m.is_running());
    }

    #[test]
    fn failed_terminal_carries_reason() {
        let class = MachineClass::builder("Fails")
            .terminal_states(["Failed"])
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        let reason = Rc::new(RefCell::new(String::new()));
        let reason2 = reason.clone();
        m.failed.connect(move |r: &String| *reason2.borrow_mut() = r.clone());

        m.start("A", Args::new()).unwrap();
        m.change_state("Failed", Args::from_iter([Value::Text("jammed".into())]))
            .unwrap();
        assert_eq!(*reason.borrow(), "jammed");
        assert_eq!(m.run_state(), RunState::Failed);
    }

    #[test]
    fn heartbeat_fault_fails_the_machine() {
        struct Flaky;
        impl State for Flaky {
            fn on_heartbeat(&mut self, _ctx: &mut StateCtx, _dt: f64) -> Result<(), StateFault> {
                Err(StateFault::new("sensor offline"))
            }
        }
        let class = MachineClass::builder("Flaky")
            .register(|m| {
                m.add_state("A", StateDef::object(Flaky)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        let reason = Rc::new(RefCell::new(String::new()));
        let reason2 = reason.clone();
        m.failed.connect(move |r: &String| *reason2.borrow_mut() = r.clone());

        m.start("A", Args::new()).unwrap();
        m.tick(0.1);
        assert_eq!(m.run_state(), RunState::Failed);
        assert_eq!(*reason.borrow(), "sensor offline");
    }

    #[test]
    fn declarative_rules_first_true_wins() {
        let class = MachineClass::builder("Ruled")
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
                m.add_state("B", StateDef::object(Noop)).unwrap();
                m.add_state("C", StateDef::object(Noop)).unwrap();
                m.add_transition("A", "B", |_ctx, _dt| false).unwrap();
                m.add_transition("A", "C", |ctx, _dt| ctx.get("go").is_some())
                    .unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        m.tick(0.1);
        assert_eq!(m.state(), Some("A"));
        m.context_set("go", Value::Bool(true));
        m.tick(0.1);
        assert_eq!(m.state(), Some("C"));
    }

    #[test]
    fn heartbeat_goto_applies_after_callback() {
        struct Hops;
        impl State for Hops {
            fn on_heartbeat(&mut self, ctx: &mut StateCtx, _dt: f64) -> Result<(), StateFault> {
                ctx.goto("B");
                Ok(())
            }
        }
        let class = MachineClass::builder("Hopper")
            .register(|m| {
                m.add_state("A", StateDef::object(Hops)).unwrap();
                m.add_state("B", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        m.tick(0.1);
        assert_eq!(m.state(), Some("B"));
    }

    #[test]
    fn sub_machine_completion_routes_parent() {
        struct FinishFast;
        impl State for FinishFast {
            fn on_heartbeat(&mut self, ctx: &mut StateCtx, _dt: f64) -> Result<(), StateFault> {
                ctx.finish();
                Ok(())
            }
        }
        let child_class = MachineClass::builder("Worker")
            .register(|m| {
                m.add_state("Busy", StateDef::object(FinishFast)).unwrap();
            })
            .build();
        let child_class2 = child_class.clone();
        let class = MachineClass::builder("Parent")
            .register(move |m| {
                m.add_state("Idle", StateDef::object(Noop)).unwrap();
                m.add_state("Next", StateDef::object(Noop)).unwrap();
                m.add_sub_machine(
                    "Work",
                    child_class2.clone(),
                    SubMachineConfig::new("Busy", "Next", "Idle").store_as("worker"),
                )
                .unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("Idle", Args::new()).unwrap();
        m.change_state("Work", Args::new()).unwrap();
        // The child id is stored in the shared context while bound.
        assert_eq!(
            m.context_get("worker"),
            Some(Value::Text("m1:Work".into()))
        );

        // Tick 1: child heartbeat finishes the child; request queued.
        m.tick(0.1);
        // Tick 2: the routed request moves the parent; the child is torn
        // down (store key removed) before "Next" is entered.
        m.tick(0.1);
        assert_eq!(m.state(), Some("Next"));
        assert_eq!(m.context_get("worker"), None);
        assert!(m.is_running());
    }

    #[test]
    fn sub_machine_failure_routes_with_reason() {
        struct FailFast;
        impl State for FailFast {
            fn on_heartbeat(&mut self, ctx: &mut StateCtx, _dt: f64) -> Result<(), StateFault> {
                ctx.fail("tool broke");
                Ok(())
            }
        }
        let child_class = MachineClass::builder("Worker")
            .register(|m| {
                m.add_state("Busy", StateDef::object(FailFast)).unwrap();
            })
            .build();
        let seen = Rc::new(RefCell::new(Args::new()));
        let seen_reg = seen.clone();
        let child_class2 = child_class.clone();
        let class = MachineClass::builder("Parent")
            .register(move |m| {
                let seen = seen_reg.clone();
                m.add_state(
                    "Recover",
                    StateDef::function(move |_ctx, args| {
                        *seen.borrow_mut() = args.clone();
                        Ok(None)
                    }),
                )
                .unwrap();
                m.add_state("Next", StateDef::object(Noop)).unwrap();
                m.add_sub_machine(
                    "Work",
                    child_class2.clone(),
                    SubMachineConfig::new("Busy", "Next", "Recover"),
                )
                .unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("Work", Args::new()).unwrap();
        m.tick(0.1);
        m.tick(0.1);
        assert_eq!(m.state(), Some("Recover"));
        assert_eq!(
            seen.borrow().first().and_then(Value::as_text),
            Some("tool broke")
        );
    }

    #[test]
    fn destroy_releases_managed_lifo() {
        let (mut m, _driver) = harness(abc_class());
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            m.manage(Disposable::Callback(Box::new(move || {
                order.borrow_mut().push(tag);
            })));
        }
        m.start("A", Args::new()).unwrap();
        m.destroy();
        assert_eq!(*order.borrow(), vec!["third", "second", "first"]);
        assert_eq!(m.run_state(), RunState::Destroyed);
        // Idempotent.
        m.destroy();
        assert_eq!(order.borrow().len(), 3);
    }

    #[test]
    fn ticks_after_stop_are_noops() {
        let class = MachineClass::builder("Stops")
            .terminal_states(["Done"])
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        m.change_state("Done", Args::new()).unwrap();
        m.tick(0.1);
        assert_eq!(m.run_state(), RunState::Finished);
    }

    #[test]
    fn view_reflects_runtime_state() {
        let class = MachineClass::builder("Viewed")
            .priority(Priority::Low)
            .register(|m| {
                m.add_state("A", StateDef::object(Noop)).unwrap();
            })
            .build();
        let (mut m, _driver) = harness(class);
        m.start("A", Args::new()).unwrap();
        let view = m.view();
        assert_eq!(view.class_name, "Viewed");
        assert_eq!(view.state.as_deref(), Some("A"));
        assert_eq!(view.priority_frames, 10);
        let json = serde_json::to_string(&view).unwrap();
        assert!(json.contains("running"));
    }
}
