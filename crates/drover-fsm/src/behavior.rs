//! Pure-functional behavior tree leaves.
//!
//! Nodes are stateless closures over the state context, so a tree can be
//! re-evaluated from the root on every tick. The combinators return
//! boxed nodes and compose freely; [`set_state`] bridges a tree decision
//! into a machine transition request.

use crate::state::StateCtx;

/// Result of evaluating a behavior node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BtStatus {
    /// The node succeeded.
    Success,
    /// The node failed.
    Failure,
    /// The node needs more ticks.
    Running,
}

/// A behavior tree node.
pub type BtNode = Box<dyn Fn(&mut StateCtx) -> BtStatus>;

/// Evaluate children in order; return the first non-`Failure` status.
///
/// An empty selector fails.
pub fn selector(children: Vec<BtNode>) -> BtNode {
    Box::new(move |ctx| {
        for child in &children {
            match child(ctx) {
                BtStatus::Failure => continue,
                other => return other,
            }
        }
        BtStatus::Failure
    })
}

/// Evaluate children in order; return the first non-`Success` status.
///
/// An empty sequence succeeds.
pub fn sequence(children: Vec<BtNode>) -> BtNode {
    Box::new(move |ctx| {
        for child in &children {
            match child(ctx) {
                BtStatus::Success => continue,
                other => return other,
            }
        }
        BtStatus::Success
    })
}

/// Swap `Success` and `Failure`; pass `Running` through.
pub fn inverter(child: BtNode) -> BtNode {
    Box::new(move |ctx| match child(ctx) {
        BtStatus::Success => BtStatus::Failure,
        BtStatus::Failure => BtStatus::Success,
        BtStatus::Running => BtStatus::Running,
    })
}

/// `Success` unless the child is still `Running`.
pub fn succeeder(child: BtNode) -> BtNode {
    Box::new(move |ctx| match child(ctx) {
        BtStatus::Running => BtStatus::Running,
        _ => BtStatus::Success,
    })
}

/// `Success` iff the predicate holds.
pub fn condition(pred: impl Fn(&StateCtx) -> bool + 'static) -> BtNode {
    Box::new(move |ctx| {
        if pred(ctx) {
            BtStatus::Success
        } else {
            BtStatus::Failure
        }
    })
}

/// Request a machine transition to `name` and succeed.
pub fn set_state(name: impl Into<String>) -> BtNode {
    let name = name.into();
    Box::new(move |ctx| {
        ctx.goto(name.clone());
        BtStatus::Success
    })
}
