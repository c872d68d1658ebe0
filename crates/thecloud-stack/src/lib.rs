//! thecloud-stack: declarative stack provisioning.
//!
//! Turns a template into physical resources and keeps per-resource
//! bookkeeping so a failed or deleted stack can be torn down again.
//!
//! # Architecture
//!
//! ```text
//! StackService (create/get/list/delete/validate)
//!   ├── StackRepository (persist Stack, read StackResource rows)
//!   └── JobQueue ──► StackWorker (bounded concurrency, one job per stack)
//!                      └── Provisioner
//!                            ├── provision: parse → 4 passes → CREATE_COMPLETE
//!                            │     └── on error: rollback (reverse, best effort)
//!                            └── teardown: reverse sweep → delete rows + stack
//! ```
//!
//! Creation and bookkeeping are separate steps with no transaction around
//! them; a crash in between leaves an unrecorded resource behind.

pub mod error;
pub mod provision;
pub mod rollback;
pub mod service;
pub mod worker;

pub use error::{StackError, StackResult};
pub use provision::{ProvisionOutcome, Provisioner};
pub use rollback::TeardownOutcome;
pub use service::StackService;
pub use worker::{JobQueue, StackJob, StackWorker, job_queue};
