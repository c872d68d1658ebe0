//! thecloud-sim: simulated backends for TheCloud.
//!
//! `SimCloud` implements every collaborator trait from `thecloud-core`
//! against in-memory maps. Resources are owned by the principal that
//! created them; another tenant sees them as not found. Every call is
//! appended to a journal (including calls that fail) and any operation
//! can be made to fail on demand, which is how the engine tests exercise
//! rollback, backoff and best-effort paths.

pub mod cloud;
pub mod journal;

pub use cloud::{DEFAULT_CIDR_BLOCK, SimCloud, Target};
pub use journal::{SimCall, SimOp};
