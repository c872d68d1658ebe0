//! Backend collaborator contracts.
//!
//! The stack provisioner and the autoscaling reconciler never talk to a
//! hypervisor, SDN controller or block store directly. They drive these
//! traits, each call carrying the `OpContext` of the tenant that owns the
//! record being processed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::BackendResult;
use crate::types::{EventRecord, Instance, LaunchSpec, Snapshot, Volume, Vpc};

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn launch_instance(&self, ctx: &OpContext, spec: LaunchSpec) -> BackendResult<Instance>;

    async fn terminate_instance(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()>;
}

#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create a VPC. `cidr_block` of `None` lets the backend pick its default range.
    async fn create_vpc(
        &self,
        ctx: &OpContext,
        name: &str,
        cidr_block: Option<&str>,
    ) -> BackendResult<Vpc>;

    async fn delete_vpc(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()>;
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn create_volume(&self, ctx: &OpContext, name: &str, size_gb: u32)
    -> BackendResult<Volume>;

    async fn delete_volume(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()>;

    /// Start a snapshot. Completion is asynchronous on the backend side.
    async fn create_snapshot(
        &self,
        ctx: &OpContext,
        volume_id: Uuid,
        name: &str,
    ) -> BackendResult<Snapshot>;

    async fn delete_snapshot(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()>;
}

#[async_trait]
pub trait LoadBalancerBackend: Send + Sync {
    async fn add_target(
        &self,
        ctx: &OpContext,
        lb_id: Uuid,
        instance_id: Uuid,
        port: u16,
        weight: u32,
    ) -> BackendResult<()>;

    async fn remove_target(&self, ctx: &OpContext, lb_id: Uuid, instance_id: Uuid)
    -> BackendResult<()>;
}

/// Observability sink. Callers treat failures as non-fatal.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record_event(&self, ctx: &OpContext, event: EventRecord) -> BackendResult<()>;
}

/// Source of utilisation metrics for scaling policies.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Average CPU utilisation (percent) across `instances` over `window`.
    async fn average_cpu(
        &self,
        ctx: &OpContext,
        instances: &[Uuid],
        window: Duration,
    ) -> BackendResult<f64>;
}

/// The full set of backend handles the daemon wires into the engines.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub network: Arc<dyn NetworkBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub load_balancer: Arc<dyn LoadBalancerBackend>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricsSource>,
}
