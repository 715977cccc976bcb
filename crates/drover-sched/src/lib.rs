//! Frame-budgeted priority task scheduler.
//!
//! The scheduler arbitrates CPU time across every task in the runtime:
//! state machine ticks, store flushes, reaper sweeps, and user work. Each
//! host frame event drives one [`step()`](Scheduler::step), which drains
//! the event's min-heap of due tasks until the per-frame budget is spent.
//! Tasks deferred by the budget age upward in effective priority so
//! low-priority work cannot starve.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod scheduler;
pub mod task;

pub use drover_core::clock::{Clock, ManualClock};
pub use config::{SchedConfig, SchedConfigError, DEFAULT_FRAME_BUDGET, FALLBACK_FRAME_BUDGET};
pub use scheduler::{
    DispatchOutcome, DispatchRecord, EventQueueView, Scheduler, SchedulerSnapshot, StepReport,
    TaskView, EVENT_HEARTBEAT,
};
pub use task::{TaskAction, TaskFailure, TaskSpec, TaskStats};
