//! thecloud-state: embedded state store for TheCloud.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for stacks, their resource bookkeeping, scaling groups, group
//! memberships, and scaling policies.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Child records use composite keys (`{stack_id}:{seq}`,
//! `{group_id}:{instance_id}`) so related rows can be found by prefix scan.
//! Stack resources carry a zero-padded sequence number in their key, which
//! makes a prefix scan return them in creation order.
//!
//! The engines depend on the `StackRepository` and `ScalingRepository`
//! traits rather than on `StateStore` directly, so tests can substitute a
//! repository that fails on demand.

pub mod error;
pub mod repo;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repo::{ScalingRepository, StackRepository};
pub use store::StateStore;
pub use types::*;
