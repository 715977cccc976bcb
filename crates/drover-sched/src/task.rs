//! Task specifications, state, and statistics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scheduler::EVENT_HEARTBEAT;

/// A captured task action failure.
///
/// Actions report failure by returning this; the scheduler records it in
/// history and task stats, and never propagates it into the step loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailure {
    /// Human-readable description of the failure.
    pub reason: String,
}

impl TaskFailure {
    /// Build a failure from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for TaskFailure {}

/// The callable dispatched when a task runs.
pub type TaskAction = Box<dyn FnMut() -> Result<(), TaskFailure>>;

/// Parameters for scheduling a task.
///
/// Built with [`TaskSpec::new`] plus builder methods:
///
/// ```
/// use drover_sched::{TaskSpec, TaskFailure};
///
/// let spec = TaskSpec::new("heal_aura", || Ok(()))
///     .every(0.5)
///     .priority(3)
///     .on_event("heartbeat");
/// assert!(spec.recurring);
/// ```
pub struct TaskSpec {
    /// Unique task name; scheduling an existing name replaces the task.
    pub name: String,
    /// The action to dispatch.
    pub action: TaskAction,
    /// Seconds until first dispatch. Zero or negative means "next step".
    pub delay: f64,
    /// Overrides `delay` for the first dispatch only; recurrence still
    /// uses `delay`. Staggers task phases without changing periods.
    pub first_delay: Option<f64>,
    /// Whether the task re-enqueues itself after each dispatch.
    pub recurring: bool,
    /// Base priority; higher dispatches first among equally-due tasks.
    pub priority: u32,
    /// The frame event whose steps drive this task.
    pub event: String,
}

impl TaskSpec {
    /// A one-shot task due on the next step of the default event.
    pub fn new(name: impl Into<String>, action: impl FnMut() -> Result<(), TaskFailure> + 'static) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            delay: 0.0,
            first_delay: None,
            recurring: false,
            priority: 1,
            event: EVENT_HEARTBEAT.to_string(),
        }
    }

    /// Delay the first dispatch by `secs`.
    pub fn after(mut self, secs: f64) -> Self {
        self.delay = secs;
        self
    }

    /// Make the task recurring with the given period in seconds.
    pub fn every(mut self, secs: f64) -> Self {
        self.delay = secs;
        self.recurring = true;
        self
    }

    /// Override the delay for the first dispatch only.
    pub fn starting_after(mut self, secs: f64) -> Self {
        self.first_delay = Some(secs);
        self
    }

    /// Set the base priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Bind the task to a frame event other than the default.
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }
}

/// Cumulative execution statistics for a task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Number of completed dispatches.
    pub runs: u64,
    /// Number of dispatches that returned a failure.
    pub failures: u64,
    /// Total dispatch time across all runs, in microseconds.
    pub total_us: u64,
    /// Duration of the most recent dispatch, in microseconds.
    pub last_us: u64,
    /// Reason of the most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Internal per-task state.
pub(crate) struct Task {
    pub name: String,
    /// `None` while a dispatch is in flight (the action has been taken
    /// out), enforcing at most one in-flight dispatch per task.
    pub action: Option<TaskAction>,
    pub next_run_us: u64,
    pub delay_us: u64,
    pub recurring: bool,
    pub base_priority: u32,
    pub consecutive_delays: u32,
    pub event: String,
    pub sequence: u64,
    /// Bumped whenever the name is rescheduled; stale heap entries carry
    /// the old generation and are discarded on pop.
    pub generation: u64,
    pub stats: TaskStats,
}

impl Task {
    /// Effective priority under the given aging factor.
    pub fn effective_priority(&self, aging_factor: f64) -> f64 {
        f64::from(self.base_priority) + f64::from(self.consecutive_delays) * aging_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_priority_reflects_aging() {
        let mut task = Task {
            name: "t".into(),
            action: Some(Box::new(|| Ok(()))),
            next_run_us: 0,
            delay_us: 0,
            recurring: false,
            base_priority: 2,
            consecutive_delays: 0,
            event: EVENT_HEARTBEAT.into(),
            sequence: 0,
            generation: 0,
            stats: TaskStats::default(),
        };
        assert_eq!(task.effective_priority(1.0), 2.0);
        task.consecutive_delays = 3;
        assert_eq!(task.effective_priority(0.5), 3.5);
    }

    #[test]
    fn spec_builder_defaults() {
        let spec = TaskSpec::new("x", || Ok(()));
        assert_eq!(spec.delay, 0.0);
        assert!(!spec.recurring);
        assert_eq!(spec.priority, 1);
        assert_eq!(spec.event, EVENT_HEARTBEAT);
    }
}
