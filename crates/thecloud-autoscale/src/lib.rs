//! thecloud-autoscale: scaling-group reconciliation.
//!
//! Periodically drives every scaling group toward its desired size, then
//! lets target-tracking policies move that desired size.
//!
//! # Reconcile Algorithm
//!
//! ```text
//! for each group (one bulk fetch per tick):
//!     if failure_count >= threshold and now < last_failure_at + backoff:
//!         skip
//!
//!     current = len(members)
//!     if current < desired:   launch (desired - current), register with LB
//!                             (unregistrable launches are terminated again)
//!     elif current > desired: deregister + terminate newest members
//!     else:
//!         for policy not in cooldown:
//!             metric = avg cpu over members
//!             metric > target → desired += scale_out_step (≤ max)
//!             metric < target → desired -= scale_in_step  (≥ min)
//! ```
//!
//! A policy change is only recorded; the next tick's count reconciliation
//! acts on it. Failures bump `failure_count`, any successful scaling step
//! resets it.

pub mod error;
pub mod policy;
pub mod reconciler;

pub use error::ScaleError;
pub use policy::{ScaleDecision, decide};
pub use reconciler::{GroupOutcome, Reconciler, ReconcilerSettings, TickReport};
