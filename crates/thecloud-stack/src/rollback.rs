//! Best-effort rollback and teardown.
//!
//! Both walk a stack's bookkeeping rows newest-first and delete the
//! physical resource behind each, dispatching on resource type. A failed
//! delete is logged and skipped so one stuck resource never blocks the
//! rest; a resource that is already gone counts as deleted. Only failures
//! to read or clear the bookkeeping rows themselves are fatal.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use thecloud_core::{BackendError, BackendResult, OpContext, ResourceType};
use thecloud_state::{Stack, StackResource, StackStatus, StateError};

use crate::error::StackError;
use crate::provision::{ProvisionOutcome, Provisioner, owner_context};

/// How a teardown job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Physical resources swept and the stack row removed.
    Deleted,
    /// Bookkeeping could not be read or cleared; the stack row was kept.
    Aborted,
    Cancelled,
}

/// Why a sweep stopped early.
enum SweepError {
    Cancelled,
    State(StateError),
}

impl From<StateError> for SweepError {
    fn from(e: StateError) -> Self {
        SweepError::State(e)
    }
}

/// Result of deleting the physical resources behind a set of rows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SweepStats {
    deleted: usize,
    failed: usize,
}

impl Provisioner {
    /// Undo a partially created stack after `reason` stopped provisioning.
    pub(crate) async fn rollback(
        &self,
        ctx: &OpContext,
        stack: &mut Stack,
        reason: String,
    ) -> ProvisionOutcome {
        self.update_status(stack, StackStatus::RollbackInProgress, reason.clone());
        info!(stack_id = %stack.id, "rolling back stack");

        match self.sweep(ctx, stack.id).await {
            Ok(stats) => {
                info!(
                    stack_id = %stack.id,
                    deleted = stats.deleted,
                    failed = stats.failed,
                    "rollback complete"
                );
                self.update_status(stack, StackStatus::RollbackComplete, reason);
                ProvisionOutcome::RolledBack
            }
            Err(SweepError::Cancelled) => {
                info!(stack_id = %stack.id, "rollback cancelled");
                ProvisionOutcome::Cancelled
            }
            Err(SweepError::State(e)) => {
                let err = StackError::RollbackFailed(e.to_string());
                error!(stack_id = %stack.id, error = %err, "rollback failed");
                self.update_status(stack, StackStatus::RollbackFailed, format!("{reason}; {err}"));
                ProvisionOutcome::RollbackFailed
            }
        }
    }

    /// Delete every physical resource of `stack`, then the stack itself.
    ///
    /// Runs under the stack owner's principal. There is no intermediate
    /// status: the stack row simply disappears once the sweep is done.
    pub async fn teardown(&self, stack: &Stack, cancel: &CancellationToken) -> TeardownOutcome {
        let ctx = owner_context(stack, cancel);
        info!(stack_id = %stack.id, name = %stack.name, "tearing down stack");

        let stats = match self.sweep(&ctx, stack.id).await {
            Ok(stats) => stats,
            Err(SweepError::Cancelled) => {
                info!(stack_id = %stack.id, "teardown cancelled");
                return TeardownOutcome::Cancelled;
            }
            Err(SweepError::State(e)) => {
                error!(stack_id = %stack.id, error = %e, "teardown aborted");
                return TeardownOutcome::Aborted;
            }
        };

        match self.repo.delete_stack(stack.id) {
            Ok(_) => {
                info!(
                    stack_id = %stack.id,
                    deleted = stats.deleted,
                    failed = stats.failed,
                    "stack deleted"
                );
                TeardownOutcome::Deleted
            }
            Err(e) => {
                error!(stack_id = %stack.id, error = %e, "failed to delete stack row");
                TeardownOutcome::Aborted
            }
        }
    }

    /// List the stack's rows, delete their resources newest-first, then
    /// drop the rows.
    async fn sweep(&self, ctx: &OpContext, stack_id: Uuid) -> Result<SweepStats, SweepError> {
        let rows = self.repo.list_resources(stack_id)?;
        let mut stats = SweepStats::default();

        for row in rows.iter().rev() {
            match self.delete_resource(ctx, row).await {
                Ok(()) => {
                    stats.deleted += 1;
                    debug!(
                        stack_id = %stack_id,
                        logical_id = %row.logical_id,
                        resource_type = %row.resource_type,
                        "resource deleted"
                    );
                }
                Err(BackendError::Cancelled) => return Err(SweepError::Cancelled),
                Err(e) if e.is_not_found() => {
                    stats.deleted += 1;
                    debug!(
                        stack_id = %stack_id,
                        logical_id = %row.logical_id,
                        "resource already gone"
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        stack_id = %stack_id,
                        logical_id = %row.logical_id,
                        resource_type = %row.resource_type,
                        physical_id = %row.physical_id,
                        error = %e,
                        "failed to delete resource, continuing"
                    );
                }
            }
        }

        self.repo.delete_resources(stack_id)?;
        Ok(stats)
    }

    async fn delete_resource(&self, ctx: &OpContext, row: &StackResource) -> BackendResult<()> {
        let id = Uuid::parse_str(&row.physical_id).map_err(|e| {
            BackendError::InvalidInput(format!("bad physical id {:?}: {e}", row.physical_id))
        })?;
        match row.resource_type {
            ResourceType::Vpc => ctx.run(self.network.delete_vpc(ctx, id)).await,
            ResourceType::Volume => ctx.run(self.storage.delete_volume(ctx, id)).await,
            ResourceType::Instance => ctx.run(self.compute.terminate_instance(ctx, id)).await,
            ResourceType::Snapshot => ctx.run(self.storage.delete_snapshot(ctx, id)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Utc;
    use thecloud_core::SystemClock;
    use thecloud_sim::{SimCloud, SimOp};
    use thecloud_state::{StackRepository, StateResult, StateStore};

    use super::*;

    const TEMPLATE: &str = r#"
Resources:
  net: { Type: VPC }
  data: { Type: Volume }
  web:
    Type: Instance
    Properties:
      Image: nginx:latest
      VpcID: { Ref: net }
"#;

    /// Wraps the store and fails bookkeeping reads or deletes on demand.
    struct FlakyRepo {
        inner: StateStore,
        fail_list: AtomicBool,
        fail_delete_rows: AtomicBool,
    }

    impl FlakyRepo {
        fn new(inner: StateStore) -> Self {
            Self {
                inner,
                fail_list: AtomicBool::new(false),
                fail_delete_rows: AtomicBool::new(false),
            }
        }

        fn injected(op: &'static str) -> StateError {
            StateError::Storage {
                op,
                message: "injected".to_string(),
            }
        }
    }

    impl StackRepository for FlakyRepo {
        fn save_stack(&self, stack: &Stack) -> StateResult<()> {
            self.inner.save_stack(stack)
        }

        fn get_stack(&self, id: Uuid) -> StateResult<Option<Stack>> {
            StackRepository::get_stack(&self.inner, id)
        }

        fn list_stacks_for_owner(&self, owner: Uuid) -> StateResult<Vec<Stack>> {
            self.inner.list_stacks_for_owner(owner)
        }

        fn delete_stack(&self, id: Uuid) -> StateResult<bool> {
            StackRepository::delete_stack(&self.inner, id)
        }

        fn add_resource(&self, resource: &StackResource) -> StateResult<()> {
            self.inner.add_resource(resource)
        }

        fn list_resources(&self, stack_id: Uuid) -> StateResult<Vec<StackResource>> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(Self::injected("list_resources"));
            }
            self.inner.list_resources(stack_id)
        }

        fn delete_resources(&self, stack_id: Uuid) -> StateResult<u32> {
            if self.fail_delete_rows.load(Ordering::SeqCst) {
                return Err(Self::injected("delete_resources"));
            }
            self.inner.delete_resources(stack_id)
        }
    }

    fn setup() -> (Arc<FlakyRepo>, Arc<SimCloud>, Provisioner) {
        let repo = Arc::new(FlakyRepo::new(StateStore::open_in_memory().unwrap()));
        let cloud = SimCloud::new();
        let provisioner = Provisioner::new(repo.clone(), &cloud.backends(), Arc::new(SystemClock));
        (repo, cloud, provisioner)
    }

    fn new_stack(repo: &FlakyRepo) -> Stack {
        let stack = Stack::new(Uuid::new_v4(), "app", TEMPLATE, BTreeMap::new(), Utc::now());
        repo.save_stack(&stack).unwrap();
        stack
    }

    #[tokio::test]
    async fn bookkeeping_failure_marks_rollback_failed() {
        let (repo, cloud, provisioner) = setup();
        cloud.fail(SimOp::LaunchInstance);
        repo.fail_list.store(true, Ordering::SeqCst);
        let stack = new_stack(&repo);

        let outcome = provisioner.provision(stack.clone(), &CancellationToken::new()).await;
        assert_eq!(outcome, ProvisionOutcome::RollbackFailed);

        let saved = StackRepository::get_stack(&*repo, stack.id).unwrap().unwrap();
        assert_eq!(saved.status, StackStatus::RollbackFailed);
        assert!(saved.status_reason.starts_with("failed to create Instance web"));
        assert!(saved.status_reason.contains("rollback failed"));

        // Nothing could be listed, so nothing was deleted.
        assert_eq!(cloud.live_resources(), 2);
    }

    #[tokio::test]
    async fn failing_row_cleanup_marks_rollback_failed() {
        let (repo, cloud, provisioner) = setup();
        cloud.fail(SimOp::LaunchInstance);
        repo.fail_delete_rows.store(true, Ordering::SeqCst);
        let stack = new_stack(&repo);

        let outcome = provisioner.provision(stack.clone(), &CancellationToken::new()).await;
        assert_eq!(outcome, ProvisionOutcome::RollbackFailed);
        // Physical resources were still swept before the row delete failed.
        assert_eq!(cloud.live_resources(), 0);
    }

    #[tokio::test]
    async fn teardown_deletes_in_reverse_and_removes_stack() {
        let (repo, cloud, provisioner) = setup();
        let stack = new_stack(&repo);
        let cancel = CancellationToken::new();
        assert_eq!(
            provisioner.provision(stack.clone(), &cancel).await,
            ProvisionOutcome::Complete
        );
        cloud.clear_journal();

        assert_eq!(provisioner.teardown(&stack, &cancel).await, TeardownOutcome::Deleted);

        let ops: Vec<_> = cloud.journal().into_iter().map(|(_, c)| c.op()).collect();
        assert_eq!(
            ops,
            [SimOp::TerminateInstance, SimOp::DeleteVolume, SimOp::DeleteVpc]
        );
        assert_eq!(cloud.live_resources(), 0);
        assert!(StackRepository::get_stack(&*repo, stack.id).unwrap().is_none());
        assert!(repo.list_resources(stack.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn teardown_swallows_delete_errors() {
        let (repo, cloud, provisioner) = setup();
        let stack = new_stack(&repo);
        let cancel = CancellationToken::new();
        provisioner.provision(stack.clone(), &cancel).await;
        cloud.fail(SimOp::DeleteVolume);

        assert_eq!(provisioner.teardown(&stack, &cancel).await, TeardownOutcome::Deleted);
        assert_eq!(cloud.volumes().len(), 1);
        assert!(cloud.vpcs().is_empty());
        assert!(StackRepository::get_stack(&*repo, stack.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn teardown_treats_missing_resources_as_deleted() {
        let (repo, cloud, provisioner) = setup();
        let stack = new_stack(&repo);
        let cancel = CancellationToken::new();
        provisioner.provision(stack.clone(), &cancel).await;

        // Someone removed the instance out of band.
        let instance = cloud.instances()[0].id;
        let ctx = owner_context(&stack, &cancel);
        ctx.run(provisioner.compute.terminate_instance(&ctx, instance))
            .await
            .unwrap();

        assert_eq!(provisioner.teardown(&stack, &cancel).await, TeardownOutcome::Deleted);
        assert_eq!(cloud.live_resources(), 0);
    }

    #[tokio::test]
    async fn teardown_keeps_stack_when_rows_unreadable() {
        let (repo, cloud, provisioner) = setup();
        let stack = new_stack(&repo);
        let cancel = CancellationToken::new();
        provisioner.provision(stack.clone(), &cancel).await;
        repo.fail_list.store(true, Ordering::SeqCst);

        assert_eq!(provisioner.teardown(&stack, &cancel).await, TeardownOutcome::Aborted);
        assert!(StackRepository::get_stack(&*repo, stack.id).unwrap().is_some());
        assert_eq!(cloud.live_resources(), 3);
    }
}
