//! Multi-pass stack provisioning.
//!
//! A stack's template is parsed, then its resources are created in four
//! fixed passes (VPC, Volume, Instance, Snapshot). Before each creation the
//! resource's references are rewritten to the physical ids recorded by
//! earlier creations. Every collaborator call runs under the stack owner's
//! principal. The first hard creation error hands the stack to rollback
//! and stops the remaining passes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use thecloud_core::{
    BackendError, BackendResult, Backends, Clock, ComputeBackend, LaunchSpec, NetworkBackend,
    OpContext, Principal, StorageBackend,
};
use thecloud_state::{Stack, StackRepository, StackResource, StackStatus};
use thecloud_template::{PhysicalIds, RefOr, ResourceDefinition, Template};

use crate::error::StackError;

/// How a provisioning job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Every resource was created; the stack is `CREATE_COMPLETE`.
    Complete,
    /// The template was rejected before anything was created (`CREATE_FAILED`).
    InvalidTemplate,
    /// A creation failed and the stack was rolled back (`ROLLBACK_COMPLETE`).
    RolledBack,
    /// Rollback could not read or clear the bookkeeping rows (`ROLLBACK_FAILED`).
    RollbackFailed,
    /// The job was cancelled; the stack's status was left as it was.
    Cancelled,
}

/// Drives stack creation, rollback and teardown against the backends.
pub struct Provisioner {
    pub(crate) repo: Arc<dyn StackRepository>,
    pub(crate) compute: Arc<dyn ComputeBackend>,
    pub(crate) network: Arc<dyn NetworkBackend>,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Provisioner {
    pub fn new(repo: Arc<dyn StackRepository>, backends: &Backends, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            compute: backends.compute.clone(),
            network: backends.network.clone(),
            storage: backends.storage.clone(),
            clock,
        }
    }

    /// Create every resource of `stack`, rolling back on the first failure.
    ///
    /// `stack` is the job's own copy; the caller that created the stack
    /// never observes it being mutated.
    pub async fn provision(&self, mut stack: Stack, cancel: &CancellationToken) -> ProvisionOutcome {
        let ctx = owner_context(&stack, cancel);
        info!(stack_id = %stack.id, name = %stack.name, owner = %stack.owner, "provisioning stack");

        let template = match Template::parse(&stack.template) {
            Ok(template) => template,
            Err(e) => {
                let err = StackError::from(e);
                warn!(stack_id = %stack.id, error = %err, "template rejected");
                self.update_status(&mut stack, StackStatus::CreateFailed, err.to_string());
                return ProvisionOutcome::InvalidTemplate;
            }
        };

        let mut ids = PhysicalIds::new();
        for (logical_id, definition) in template.creation_order() {
            let definition = definition.resolve_refs(&ids);
            let resource_type = definition.resource_type();

            let physical_id = match self.create(&ctx, &stack, logical_id, &definition).await {
                Ok(id) => id,
                Err(BackendError::Cancelled) => {
                    info!(stack_id = %stack.id, logical_id, "provisioning cancelled");
                    return ProvisionOutcome::Cancelled;
                }
                Err(cause) => {
                    let err = StackError::ResourceCreationFailed {
                        resource_type,
                        logical_id: logical_id.to_string(),
                        cause,
                    };
                    error!(stack_id = %stack.id, error = %err, "resource creation failed");
                    return self.rollback(&ctx, &mut stack, err.to_string()).await;
                }
            };

            // Not transactional with the creation above: a lost row leaves
            // an orphaned physical resource.
            let row = StackResource::new(
                stack.id,
                logical_id,
                &physical_id,
                resource_type,
                self.clock.now(),
            );
            if let Err(e) = self.repo.add_resource(&row) {
                warn!(
                    stack_id = %stack.id,
                    logical_id,
                    physical_id = %physical_id,
                    error = %e,
                    "failed to record stack resource"
                );
            }

            debug!(
                stack_id = %stack.id,
                logical_id,
                resource_type = %resource_type,
                physical_id = %physical_id,
                "resource created"
            );
            ids.insert(logical_id, physical_id);
        }

        self.update_status(&mut stack, StackStatus::CreateComplete, "");
        info!(stack_id = %stack.id, resources = ids.len(), "stack created");
        ProvisionOutcome::Complete
    }

    /// Create one resource and return its physical id.
    async fn create(
        &self,
        ctx: &OpContext,
        stack: &Stack,
        logical_id: &str,
        definition: &ResourceDefinition,
    ) -> BackendResult<String> {
        let name = definition
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{logical_id}-{}", stack.short_id()));

        match definition {
            ResourceDefinition::Vpc(props) => {
                let vpc = ctx
                    .run(self.network.create_vpc(ctx, &name, props.cidr_block.as_deref()))
                    .await?;
                Ok(vpc.id.to_string())
            }
            ResourceDefinition::Volume(props) => {
                let volume = ctx
                    .run(self.storage.create_volume(ctx, &name, props.size_gb()))
                    .await?;
                Ok(volume.id.to_string())
            }
            ResourceDefinition::Instance(props) => {
                let vpc_id = props
                    .vpc_id
                    .as_ref()
                    .map(|v| physical_uuid("VpcID", v))
                    .transpose()?;
                let spec = LaunchSpec {
                    name,
                    image: props.image.clone(),
                    ports: props.ports().to_string(),
                    vpc_id,
                    volumes: Vec::new(),
                };
                let instance = ctx.run(self.compute.launch_instance(ctx, spec)).await?;
                Ok(instance.id.to_string())
            }
            ResourceDefinition::Snapshot(props) => {
                let volume_id = physical_uuid("VolumeID", &props.volume_id)?;
                let snapshot = ctx
                    .run(self.storage.create_snapshot(ctx, volume_id, &name))
                    .await?;
                Ok(snapshot.id.to_string())
            }
        }
    }

    /// Set and persist a status transition. Persistence failures are logged;
    /// the job carries on with its in-memory copy.
    pub(crate) fn update_status(
        &self,
        stack: &mut Stack,
        status: StackStatus,
        reason: impl Into<String>,
    ) {
        stack.set_status(status, reason, self.clock.now());
        if let Err(e) = self.repo.save_stack(stack) {
            warn!(stack_id = %stack.id, status = %status, error = %e, "failed to persist stack status");
        }
    }
}

pub(crate) fn owner_context(stack: &Stack, cancel: &CancellationToken) -> OpContext {
    OpContext::new(Principal::new(stack.owner)).with_cancel(cancel.clone())
}

/// The id a reference-capable property must hold by the time its resource
/// is created.
fn physical_uuid(field: &str, value: &RefOr<String>) -> BackendResult<Uuid> {
    match value {
        RefOr::Ref(r) => Err(BackendError::InvalidInput(format!(
            "{field}: unresolved reference to {}",
            r.logical_id
        ))),
        RefOr::Value(id) => Uuid::parse_str(id.trim()).map_err(|e| {
            BackendError::InvalidInput(format!("{field}: {id:?} is not a resource id: {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::Utc;
    use thecloud_core::{ManualClock, ResourceType};
    use thecloud_sim::{SimCall, SimCloud, SimOp};
    use thecloud_state::{ResourceStatus, StateStore};

    use super::*;

    const FULL: &str = r#"
Resources:
  backup:
    Type: Snapshot
    Properties:
      VolumeID: { Ref: data }
  web:
    Type: Instance
    Properties:
      Image: nginx:latest
      VpcID: { Ref: net }
  data:
    Type: Volume
    Properties:
      Size: 20
  net:
    Type: VPC
    Properties:
      CIDRBlock: 10.1.0.0/16
"#;

    struct Fixture {
        store: Arc<StateStore>,
        cloud: Arc<SimCloud>,
        provisioner: Provisioner,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let cloud = SimCloud::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let provisioner = Provisioner::new(store.clone(), &cloud.backends(), clock);
        Fixture {
            store,
            cloud,
            provisioner,
        }
    }

    fn saved_stack(store: &StateStore, template: &str) -> Stack {
        let stack = Stack::new(Uuid::new_v4(), "web", template, BTreeMap::new(), Utc::now());
        store.put_stack(&stack).unwrap();
        stack
    }

    #[tokio::test]
    async fn creates_resources_in_pass_order() {
        let f = fixture();
        let stack = saved_stack(&f.store, FULL);

        let outcome = f
            .provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProvisionOutcome::Complete);

        let saved = f.store.get_stack(stack.id).unwrap().unwrap();
        assert_eq!(saved.status, StackStatus::CreateComplete);

        let rows = f.store.list_stack_resources(stack.id).unwrap();
        let order: Vec<_> = rows
            .iter()
            .map(|r| (r.logical_id.as_str(), r.resource_type))
            .collect();
        assert_eq!(
            order,
            [
                ("net", ResourceType::Vpc),
                ("data", ResourceType::Volume),
                ("web", ResourceType::Instance),
                ("backup", ResourceType::Snapshot),
            ]
        );
        assert_eq!(rows[3].status, ResourceStatus::CreateInProgress);
        assert!(rows[..3].iter().all(|r| r.status == ResourceStatus::CreateComplete));
        assert_eq!(f.cloud.live_resources(), 4);
    }

    #[tokio::test]
    async fn references_resolve_to_recorded_physical_ids() {
        let f = fixture();
        let stack = saved_stack(&f.store, FULL);
        f.provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;

        let rows = f.store.list_stack_resources(stack.id).unwrap();
        let vpc_id: Uuid = rows[0].physical_id.parse().unwrap();
        let volume_id: Uuid = rows[1].physical_id.parse().unwrap();

        let instance = &f.cloud.instances()[0];
        assert_eq!(instance.vpc_id, Some(vpc_id));
        assert_eq!(f.cloud.snapshots()[0].volume_id, volume_id);
    }

    #[tokio::test]
    async fn calls_run_as_owner_with_default_names() {
        let f = fixture();
        let stack = saved_stack(&f.store, FULL);
        f.provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;

        let journal = f.cloud.journal();
        assert_eq!(journal.len(), 4);
        assert!(journal.iter().all(|(p, _)| p.user_id == stack.owner));

        let short = stack.short_id();
        assert_eq!(
            journal[0].1,
            SimCall::CreateVpc {
                name: format!("net-{short}"),
                cidr_block: Some("10.1.0.0/16".to_string()),
            }
        );
        match &journal[2].1 {
            SimCall::LaunchInstance { name, ports, .. } => {
                assert_eq!(name, &format!("web-{short}"));
                assert_eq!(ports, "80");
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_template_touches_nothing() {
        let f = fixture();
        for template in ["Resources: {}", "Resources: [", "Resources:\n  q: { Type: Queue }\n"] {
            let stack = saved_stack(&f.store, template);
            let outcome = f
                .provisioner
                .provision(stack.clone(), &CancellationToken::new())
                .await;
            assert_eq!(outcome, ProvisionOutcome::InvalidTemplate);

            let saved = f.store.get_stack(stack.id).unwrap().unwrap();
            assert_eq!(saved.status, StackStatus::CreateFailed);
            assert!(saved.status_reason.starts_with("invalid template"));
            assert!(f.store.list_stack_resources(stack.id).unwrap().is_empty());
        }
        assert!(f.cloud.journal().is_empty());
    }

    #[tokio::test]
    async fn failure_rolls_back_in_reverse_order() {
        let f = fixture();
        f.cloud.fail(SimOp::LaunchInstance);
        let stack = saved_stack(&f.store, FULL);

        let outcome = f
            .provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProvisionOutcome::RolledBack);

        let saved = f.store.get_stack(stack.id).unwrap().unwrap();
        assert_eq!(saved.status, StackStatus::RollbackComplete);
        assert!(saved.status_reason.contains("failed to create Instance web"));
        assert!(f.store.list_stack_resources(stack.id).unwrap().is_empty());
        assert_eq!(f.cloud.live_resources(), 0);

        // Snapshot pass never ran.
        assert!(f.cloud.calls(SimOp::CreateSnapshot).is_empty());

        let deletes: Vec<_> = f
            .cloud
            .journal()
            .into_iter()
            .map(|(_, call)| call.op())
            .filter(|op| matches!(op, SimOp::DeleteVolume | SimOp::DeleteVpc))
            .collect();
        assert_eq!(deletes, [SimOp::DeleteVolume, SimOp::DeleteVpc]);
    }

    #[tokio::test]
    async fn failure_mid_pass_keeps_same_pass_predecessors() {
        let f = fixture();
        f.cloud.fail_after(SimOp::CreateVolume, 1);
        let stack = saved_stack(
            &f.store,
            r#"
Resources:
  first: { Type: Volume }
  second: { Type: Volume }
  third: { Type: Volume }
"#,
        );

        let outcome = f
            .provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProvisionOutcome::RolledBack);
        assert_eq!(f.cloud.calls(SimOp::CreateVolume).len(), 2);
        assert_eq!(f.cloud.calls(SimOp::DeleteVolume).len(), 1);
        assert!(f.cloud.volumes().is_empty());
    }

    #[tokio::test]
    async fn rollback_continues_past_delete_errors() {
        let f = fixture();
        f.cloud.fail(SimOp::CreateSnapshot);
        f.cloud.fail(SimOp::DeleteVolume);
        let stack = saved_stack(&f.store, FULL);

        let outcome = f
            .provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProvisionOutcome::RolledBack);

        // The stuck volume did not stop the VPC from being removed.
        assert_eq!(f.cloud.calls(SimOp::TerminateInstance).len(), 1);
        assert_eq!(f.cloud.calls(SimOp::DeleteVolume).len(), 1);
        assert_eq!(f.cloud.calls(SimOp::DeleteVpc).len(), 1);
        assert!(f.cloud.vpcs().is_empty());
        assert_eq!(f.cloud.volumes().len(), 1);

        let saved = f.store.get_stack(stack.id).unwrap().unwrap();
        assert_eq!(saved.status, StackStatus::RollbackComplete);
    }

    #[tokio::test]
    async fn forward_reference_fails_creation() {
        let f = fixture();
        let stack = saved_stack(
            &f.store,
            r#"
Resources:
  web:
    Type: Instance
    Properties:
      Image: nginx
      VpcID: { Ref: backup }
  data: { Type: Volume }
  backup:
    Type: Snapshot
    Properties:
      VolumeID: { Ref: data }
"#,
        );

        let outcome = f
            .provisioner
            .provision(stack.clone(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProvisionOutcome::RolledBack);

        let saved = f.store.get_stack(stack.id).unwrap().unwrap();
        assert!(saved.status_reason.contains("unresolved reference to backup"));
        assert!(f.cloud.calls(SimOp::LaunchInstance).is_empty());
        assert_eq!(f.cloud.live_resources(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_changes_nothing() {
        let f = fixture();
        let stack = saved_stack(&f.store, FULL);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f.provisioner.provision(stack.clone(), &cancel).await;
        assert_eq!(outcome, ProvisionOutcome::Cancelled);

        let saved = f.store.get_stack(stack.id).unwrap().unwrap();
        assert_eq!(saved.status, StackStatus::CreateInProgress);
        assert!(f.cloud.journal().is_empty());
    }

    #[tokio::test]
    async fn cancelled_mid_pass_keeps_created_resources() {
        let f = fixture();
        f.cloud.set_latency(Duration::from_millis(100));
        let stack = saved_stack(&f.store, FULL);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                cancel.cancel();
            })
        };
        let outcome = f.provisioner.provision(stack.clone(), &cancel).await;
        canceller.await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::Cancelled);

        let saved = f.store.get_stack(stack.id).unwrap().unwrap();
        assert_eq!(saved.status, StackStatus::CreateInProgress);

        // No rollback: whatever was created is still recorded and live.
        let rows = f.store.list_stack_resources(stack.id).unwrap();
        assert_eq!(rows.len(), f.cloud.live_resources());
        assert!(f.cloud.journal().iter().all(|(_, call)| !matches!(
            call.op(),
            SimOp::DeleteVpc | SimOp::DeleteVolume | SimOp::TerminateInstance
        )));
    }
}
