//! `SimCloud`: an in-memory, tenant-aware stand-in for every backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use thecloud_core::{
    BackendError, BackendResult, Backends, ComputeBackend, EventRecord, EventSink, Instance,
    LaunchSpec, LoadBalancerBackend, MetricsSource, NetworkBackend, OpContext, Principal, Snapshot,
    StorageBackend, Volume, Vpc, container_port,
};

use crate::journal::{Faults, SimCall, SimOp};

/// CIDR handed out when a VPC is created without one.
pub const DEFAULT_CIDR_BLOCK: &str = "10.0.0.0/16";

#[derive(Debug, Clone)]
struct Owned<T> {
    owner: Uuid,
    value: T,
}

/// A registered load-balancer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub instance_id: Uuid,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Default)]
struct SimState {
    vpcs: HashMap<Uuid, Owned<Vpc>>,
    volumes: HashMap<Uuid, Owned<Volume>>,
    snapshots: HashMap<Uuid, Owned<Snapshot>>,
    instances: HashMap<Uuid, Owned<Instance>>,
    load_balancers: HashMap<Uuid, Owned<BTreeMap<Uuid, Target>>>,
    events: Vec<EventRecord>,
    cpu: HashMap<Uuid, f64>,
    default_cpu: f64,
    journal: Vec<(Principal, SimCall)>,
    faults: Faults,
}

impl SimState {
    fn owned_by<T>(map: &HashMap<Uuid, Owned<T>>, id: Uuid, owner: Uuid) -> bool {
        map.get(&id).is_some_and(|o| o.owner == owner)
    }
}

/// Simulated cloud. All tenants share one instance; each resource
/// remembers its owner and is invisible to everyone else.
#[derive(Debug, Default)]
pub struct SimCloud {
    state: Mutex<SimState>,
    latency: Mutex<Duration>,
}

impl SimCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every backend handle, all pointing at this simulator.
    pub fn backends(self: &Arc<Self>) -> Backends {
        Backends {
            compute: self.clone(),
            network: self.clone(),
            storage: self.clone(),
            load_balancer: self.clone(),
            events: self.clone(),
            metrics: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Fault injection ───────────────────────────────────────────

    /// Fail every call of `op` with `Unavailable` until recovered.
    pub fn fail(&self, op: SimOp) {
        self.fail_after(op, 0);
    }

    /// Let `n` calls of `op` succeed, then fail the rest.
    pub fn fail_after(&self, op: SimOp, n: u32) {
        self.lock()
            .faults
            .arm(op, n, BackendError::Unavailable(format!("injected {op:?} failure")));
    }

    pub fn recover(&self, op: SimOp) {
        self.lock().faults.disarm(op);
    }

    /// Delay every call by `latency` (for cancellation tests).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    // ── Metrics knobs ─────────────────────────────────────────────

    pub fn set_cpu(&self, instance_id: Uuid, percent: f64) {
        self.lock().cpu.insert(instance_id, percent);
    }

    /// CPU reported for instances with no explicit value.
    pub fn set_default_cpu(&self, percent: f64) {
        self.lock().default_cpu = percent;
    }

    // ── Seeding ───────────────────────────────────────────────────

    /// Create a load balancer owned by `principal`.
    pub fn create_load_balancer(&self, principal: &Principal) -> Uuid {
        let id = Uuid::new_v4();
        self.adopt_load_balancer(principal, id);
        id
    }

    /// Register a load balancer that was created outside this simulator.
    /// Known ids keep their owner and targets.
    pub fn adopt_load_balancer(&self, principal: &Principal, id: Uuid) {
        self.lock().load_balancers.entry(id).or_insert(Owned {
            owner: principal.user_id,
            value: BTreeMap::new(),
        });
    }

    /// Register a VPC that was created outside this simulator. Known ids
    /// are left alone.
    pub fn adopt_vpc(&self, principal: &Principal, id: Uuid, name: &str) {
        self.lock().vpcs.entry(id).or_insert_with(|| Owned {
            owner: principal.user_id,
            value: Vpc {
                id,
                name: name.to_string(),
                cidr_block: DEFAULT_CIDR_BLOCK.to_string(),
            },
        });
    }

    // ── Inspection ────────────────────────────────────────────────

    pub fn journal(&self) -> Vec<(Principal, SimCall)> {
        self.lock().journal.clone()
    }

    /// Journaled calls of one operation, in arrival order.
    pub fn calls(&self, op: SimOp) -> Vec<SimCall> {
        self.lock()
            .journal
            .iter()
            .filter(|(_, call)| call.op() == op)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    pub fn vpcs(&self) -> Vec<Vpc> {
        self.lock().vpcs.values().map(|o| o.value.clone()).collect()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes.values().map(|o| o.value.clone()).collect()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.lock().snapshots.values().map(|o| o.value.clone()).collect()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.lock().instances.values().map(|o| o.value.clone()).collect()
    }

    pub fn has_instance(&self, id: Uuid) -> bool {
        self.lock().instances.contains_key(&id)
    }

    /// Number of live VPCs, volumes, snapshots and instances.
    pub fn live_resources(&self) -> usize {
        let state = self.lock();
        state.vpcs.len() + state.volumes.len() + state.snapshots.len() + state.instances.len()
    }

    pub fn targets(&self, lb_id: Uuid) -> Vec<Target> {
        self.lock()
            .load_balancers
            .get(&lb_id)
            .map(|lb| lb.value.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.lock().events.clone()
    }

    // ── Call plumbing ─────────────────────────────────────────────

    /// Simulated network delay, then journal the call and run fault injection.
    async fn enter(&self, ctx: &OpContext, call: SimCall) -> BackendResult<MutexGuard<'_, SimState>> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let op = call.op();
        debug!(principal = %ctx.principal(), ?op, "sim call");

        let mut state = self.lock();
        state.journal.push((*ctx.principal(), call));
        state.faults.check(op)?;
        if ctx.principal().is_anonymous() {
            return Err(BackendError::InvalidInput("anonymous principal".to_string()));
        }
        Ok(state)
    }
}

fn not_found(kind: &str, id: Uuid) -> BackendError {
    BackendError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl ComputeBackend for SimCloud {
    async fn launch_instance(&self, ctx: &OpContext, spec: LaunchSpec) -> BackendResult<Instance> {
        let call = SimCall::LaunchInstance {
            name: spec.name.clone(),
            image: spec.image.clone(),
            ports: spec.ports.clone(),
            vpc_id: spec.vpc_id,
        };
        let mut state = self.enter(ctx, call).await?;
        let owner = ctx.principal().user_id;

        if spec.image.trim().is_empty() {
            return Err(BackendError::InvalidInput("image is required".to_string()));
        }
        if container_port(&spec.ports).is_none() {
            return Err(BackendError::InvalidInput(format!(
                "invalid port spec {:?}",
                spec.ports
            )));
        }
        if let Some(vpc_id) = spec.vpc_id
            && !SimState::owned_by(&state.vpcs, vpc_id, owner)
        {
            return Err(not_found("vpc", vpc_id));
        }
        for attachment in &spec.volumes {
            if !SimState::owned_by(&state.volumes, attachment.volume_id, owner) {
                return Err(not_found("volume", attachment.volume_id));
            }
        }

        let instance = Instance {
            id: Uuid::new_v4(),
            name: spec.name,
            image: spec.image,
            ports: spec.ports,
            vpc_id: spec.vpc_id,
        };
        state.instances.insert(
            instance.id,
            Owned {
                owner,
                value: instance.clone(),
            },
        );
        Ok(instance)
    }

    async fn terminate_instance(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()> {
        let mut state = self.enter(ctx, SimCall::TerminateInstance(id)).await?;
        if !SimState::owned_by(&state.instances, id, ctx.principal().user_id) {
            return Err(not_found("instance", id));
        }
        state.instances.remove(&id);
        state.cpu.remove(&id);
        for lb in state.load_balancers.values_mut() {
            lb.value.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkBackend for SimCloud {
    async fn create_vpc(
        &self,
        ctx: &OpContext,
        name: &str,
        cidr_block: Option<&str>,
    ) -> BackendResult<Vpc> {
        let call = SimCall::CreateVpc {
            name: name.to_string(),
            cidr_block: cidr_block.map(str::to_string),
        };
        let mut state = self.enter(ctx, call).await?;
        let vpc = Vpc {
            id: Uuid::new_v4(),
            name: name.to_string(),
            cidr_block: cidr_block.unwrap_or(DEFAULT_CIDR_BLOCK).to_string(),
        };
        state.vpcs.insert(
            vpc.id,
            Owned {
                owner: ctx.principal().user_id,
                value: vpc.clone(),
            },
        );
        Ok(vpc)
    }

    async fn delete_vpc(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()> {
        let mut state = self.enter(ctx, SimCall::DeleteVpc(id)).await?;
        if !SimState::owned_by(&state.vpcs, id, ctx.principal().user_id) {
            return Err(not_found("vpc", id));
        }
        if state.instances.values().any(|i| i.value.vpc_id == Some(id)) {
            return Err(BackendError::Conflict(format!("vpc {id} still has instances")));
        }
        state.vpcs.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SimCloud {
    async fn create_volume(
        &self,
        ctx: &OpContext,
        name: &str,
        size_gb: u32,
    ) -> BackendResult<Volume> {
        let call = SimCall::CreateVolume {
            name: name.to_string(),
            size_gb,
        };
        let mut state = self.enter(ctx, call).await?;
        if size_gb == 0 {
            return Err(BackendError::InvalidInput("volume size must be positive".to_string()));
        }
        let volume = Volume {
            id: Uuid::new_v4(),
            name: name.to_string(),
            size_gb,
        };
        state.volumes.insert(
            volume.id,
            Owned {
                owner: ctx.principal().user_id,
                value: volume.clone(),
            },
        );
        Ok(volume)
    }

    async fn delete_volume(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()> {
        let mut state = self.enter(ctx, SimCall::DeleteVolume(id)).await?;
        if !SimState::owned_by(&state.volumes, id, ctx.principal().user_id) {
            return Err(not_found("volume", id));
        }
        state.volumes.remove(&id);
        Ok(())
    }

    async fn create_snapshot(
        &self,
        ctx: &OpContext,
        volume_id: Uuid,
        name: &str,
    ) -> BackendResult<Snapshot> {
        let call = SimCall::CreateSnapshot {
            volume_id,
            name: name.to_string(),
        };
        let mut state = self.enter(ctx, call).await?;
        let owner = ctx.principal().user_id;
        if !SimState::owned_by(&state.volumes, volume_id, owner) {
            return Err(not_found("volume", volume_id));
        }
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            volume_id,
            name: name.to_string(),
        };
        state.snapshots.insert(
            snapshot.id,
            Owned {
                owner,
                value: snapshot.clone(),
            },
        );
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, ctx: &OpContext, id: Uuid) -> BackendResult<()> {
        let mut state = self.enter(ctx, SimCall::DeleteSnapshot(id)).await?;
        if !SimState::owned_by(&state.snapshots, id, ctx.principal().user_id) {
            return Err(not_found("snapshot", id));
        }
        state.snapshots.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerBackend for SimCloud {
    async fn add_target(
        &self,
        ctx: &OpContext,
        lb_id: Uuid,
        instance_id: Uuid,
        port: u16,
        weight: u32,
    ) -> BackendResult<()> {
        let call = SimCall::AddTarget {
            lb_id,
            instance_id,
            port,
            weight,
        };
        let mut state = self.enter(ctx, call).await?;
        let owner = ctx.principal().user_id;
        if !SimState::owned_by(&state.instances, instance_id, owner) {
            return Err(not_found("instance", instance_id));
        }
        let lb = state
            .load_balancers
            .get_mut(&lb_id)
            .filter(|lb| lb.owner == owner)
            .ok_or_else(|| not_found("load balancer", lb_id))?;
        lb.value.insert(
            instance_id,
            Target {
                instance_id,
                port,
                weight,
            },
        );
        Ok(())
    }

    async fn remove_target(
        &self,
        ctx: &OpContext,
        lb_id: Uuid,
        instance_id: Uuid,
    ) -> BackendResult<()> {
        let call = SimCall::RemoveTarget { lb_id, instance_id };
        let mut state = self.enter(ctx, call).await?;
        let owner = ctx.principal().user_id;
        let lb = state
            .load_balancers
            .get_mut(&lb_id)
            .filter(|lb| lb.owner == owner)
            .ok_or_else(|| not_found("load balancer", lb_id))?;
        lb.value
            .remove(&instance_id)
            .map(|_| ())
            .ok_or_else(|| not_found("target", instance_id))
    }
}

#[async_trait]
impl EventSink for SimCloud {
    async fn record_event(&self, ctx: &OpContext, event: EventRecord) -> BackendResult<()> {
        let mut state = self.enter(ctx, SimCall::RecordEvent(event.clone())).await?;
        state.events.push(event);
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for SimCloud {
    async fn average_cpu(
        &self,
        ctx: &OpContext,
        instances: &[Uuid],
        _window: Duration,
    ) -> BackendResult<f64> {
        let call = SimCall::AverageCpu {
            instances: instances.to_vec(),
        };
        let state = self.enter(ctx, call).await?;
        if instances.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = instances
            .iter()
            .map(|id| state.cpu.get(id).copied().unwrap_or(state.default_cpu))
            .sum();
        Ok(total / instances.len() as f64)
    }
}
