//! Hierarchical state machine engine.
//!
//! Machines drive agent behavior over time: explicit named states,
//! validated transitions, deferred transitions with atomic invalidation,
//! and sub-machine composition whose lifecycle signals route parent
//! transitions. A machine is ticked by the scheduler at its priority's
//! frame interval; state callbacks report failures as values, which the
//! machine converts into its `Failed` lifecycle signal.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod behavior;
pub mod class;
pub mod machine;
pub mod state;

pub use behavior::{condition, inverter, selector, sequence, set_state, succeeder, BtNode, BtStatus};
pub use class::{MachineClass, MachineClassBuilder, Priority, SubMachineConfig};
pub use machine::{ContextMap, MachineView, RunState, StateChange, StateMachine};
pub use state::{Cleanup, State, StateCtx, StateDef, StateFault, StateFn, TransitionRule};
