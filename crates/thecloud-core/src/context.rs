//! Tenant identity and cancellation scope for backend calls.
//!
//! Background engines have no request to inherit an identity from, so
//! every backend call receives an `OpContext` built from the owner of the
//! record being processed. Downstream isolation checks see the same
//! principal they would see for a user-initiated call.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BackendError, BackendResult};

/// The tenant on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }

    /// A principal with no identity. Rejected by every tenant-scoped entry point.
    pub fn anonymous() -> Self {
        Self { user_id: Uuid::nil() }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_nil()
    }

    /// Whether this principal owns a record with the given owner id.
    pub fn owns(&self, owner: Uuid) -> bool {
        !self.is_anonymous() && self.user_id == owner
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_id)
    }
}

/// Execution context passed to every backend call.
#[derive(Debug, Clone)]
pub struct OpContext {
    principal: Principal,
    cancel: CancellationToken,
}

impl OpContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this context to an outer cancellation scope.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive a backend call, aborting it if the context is cancelled first.
    ///
    /// Only the in-flight call is abandoned; whatever it already committed
    /// on the backend side stays committed.
    pub async fn run<T, F>(&self, call: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            result = call => result,
        }
    }
}
