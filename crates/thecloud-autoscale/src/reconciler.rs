//! Reconciler: per-tick scaling-group control loop.
//!
//! Each tick fetches every scaling group with its members and policies in
//! one read, then walks the groups in fetch order. A group goes through
//! three strictly sequential phases:
//!
//! 1. Backoff gate: too many recent failures and the group is skipped.
//! 2. Count reconciliation: launch or terminate members until the
//!    membership matches `desired_count`.
//! 3. Policy evaluation: only when phase 2 had nothing to do.
//!
//! Every backend call runs as the group's owner. Per-instance failures
//! never escape a tick; they are absorbed into `failure_count` and
//! `last_failure_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use thecloud_core::config::ReconcilerConfig;
use thecloud_core::{
    Backends, Clock, ComputeBackend, ConfigError, EventRecord, EventSink, LaunchSpec,
    LoadBalancerBackend, MetricsSource, OpContext, Principal, container_port,
};
use thecloud_state::{
    GroupMember, MetricType, ScalingGroup, ScalingGroupSnapshot, ScalingPolicy,
    ScalingRepository,
};

use crate::error::ScaleError;
use crate::policy::{ScaleDecision, decide};

const RESOURCE_TYPE: &str = "SCALING_GROUP";
const LB_TARGET_WEIGHT: u32 = 1;

/// Tunables for the reconciler, resolved from `[reconciler]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Failures at or above this count put a group into backoff.
    pub failure_threshold: u32,
    pub backoff_window: chrono::Duration,
    /// Window over which policy metrics are averaged.
    pub metric_window: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            backoff_window: chrono::Duration::minutes(5),
            metric_window: Duration::from_secs(300),
        }
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &ReconcilerConfig) -> Result<Self, ConfigError> {
        let backoff_window =
            chrono::Duration::from_std(config.backoff()?).map_err(|e| ConfigError::Invalid {
                field: "reconciler.backoff_window",
                reason: e.to_string(),
            })?;
        Ok(Self {
            failure_threshold: config.failure_threshold,
            backoff_window,
            metric_window: config.metrics_window()?,
        })
    }
}

/// What happened to one group during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Skipped by the failure backoff gate.
    BackedOff,
    ScaledOut { launched: u32, failed: bool },
    ScaledIn { terminated: u32, failed: bool },
    /// A policy moved the desired count; applied on a later tick.
    PolicyAdjusted { from: u32, to: u32 },
    /// Membership already matched and no policy fired.
    Steady,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub groups: Vec<(Uuid, GroupOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, group_id: Uuid) -> Option<GroupOutcome> {
        self.groups
            .iter()
            .find(|(id, _)| *id == group_id)
            .map(|(_, outcome)| *outcome)
    }
}

/// Drives every scaling group toward its desired size.
pub struct Reconciler {
    repo: Arc<dyn ScalingRepository>,
    compute: Arc<dyn ComputeBackend>,
    load_balancer: Arc<dyn LoadBalancerBackend>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSource>,
    clock: Arc<dyn Clock>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn ScalingRepository>,
        backends: &Backends,
        clock: Arc<dyn Clock>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            repo,
            compute: backends.compute.clone(),
            load_balancer: backends.load_balancer.clone(),
            events: backends.events.clone(),
            metrics: backends.metrics.clone(),
            clock,
            settings,
        }
    }

    /// Run one reconciliation pass over every group.
    ///
    /// Only a failed bulk fetch is returned as an error; the caller logs it
    /// and tries again next tick.
    pub async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<TickReport> {
        let snapshots = self.repo.list_group_snapshots()?;
        debug!(groups = snapshots.len(), "reconciler tick");

        let mut report = TickReport::default();
        for snapshot in snapshots {
            if cancel.is_cancelled() {
                break;
            }
            let group_id = snapshot.group.id;
            let outcome = self.reconcile_group(snapshot, cancel).await;
            report.groups.push((group_id, outcome));
        }
        Ok(report)
    }

    /// Tick every `interval` until shutdown is signalled. A tick in flight
    /// when shutdown arrives is cancelled and allowed to record what it
    /// already did.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");
        let cancel = CancellationToken::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let tick = self.tick(&cancel);
                    tokio::pin!(tick);
                    let mut stopping = false;
                    let result = tokio::select! {
                        result = &mut tick => result,
                        _ = shutdown.changed() => {
                            info!("reconciler shutting down mid-tick");
                            cancel.cancel();
                            stopping = true;
                            tick.await
                        }
                    };
                    if let Err(e) = result {
                        error!(error = %e, "reconciler tick failed");
                    }
                    if stopping {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    async fn reconcile_group(
        &self,
        snapshot: ScalingGroupSnapshot,
        cancel: &CancellationToken,
    ) -> GroupOutcome {
        let ScalingGroupSnapshot {
            mut group,
            mut members,
            mut policies,
        } = snapshot;
        let now = self.clock.now();

        if group.in_backoff(now, self.settings.failure_threshold, self.settings.backoff_window) {
            debug!(
                group = %group.id,
                failures = group.failure_count,
                "group in failure backoff, skipping"
            );
            return GroupOutcome::BackedOff;
        }

        let ctx = OpContext::new(Principal::new(group.owner)).with_cancel(cancel.child_token());
        let current = members.len() as u32;
        let desired = group.desired_count;

        if current < desired {
            self.scale_out(&ctx, &mut group, &mut members, desired - current)
                .await
        } else if current > desired {
            self.scale_in(&ctx, &mut group, &mut members, current - desired)
                .await
        } else {
            if group.current_count != current {
                group.current_count = current;
                self.persist_group(&group, "current count");
            }
            self.evaluate_policies(&ctx, &mut group, &members, &mut policies)
                .await
        }
    }

    // ── Count reconciliation ─────────────────────────────────────

    async fn scale_out(
        &self,
        ctx: &OpContext,
        group: &mut ScalingGroup,
        members: &mut Vec<GroupMember>,
        missing: u32,
    ) -> GroupOutcome {
        info!(group = %group.id, current = members.len(), desired = group.desired_count, "scaling out");
        let mut launched = 0;
        for _ in 0..missing {
            match self.add_member(ctx, group, members).await {
                Ok(()) => launched += 1,
                Err(e) if e.is_cancelled() => {
                    self.record_progress(group, members);
                    return GroupOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(group = %group.id, error = %e, "scale-out failed");
                    self.record_failure(group, members);
                    return GroupOutcome::ScaledOut {
                        launched,
                        failed: true,
                    };
                }
            }
        }
        self.record_success(group, members);
        GroupOutcome::ScaledOut {
            launched,
            failed: false,
        }
    }

    /// Launch one instance, track it, and register it with the group's
    /// load balancer. A member that cannot be registered is untracked and
    /// terminated again, so tracked members always match the targets.
    async fn add_member(
        &self,
        ctx: &OpContext,
        group: &ScalingGroup,
        members: &mut Vec<GroupMember>,
    ) -> Result<(), ScaleError> {
        let port =
            container_port(&group.ports).ok_or_else(|| ScaleError::InvalidPorts(group.ports.clone()))?;
        let suffix = Uuid::new_v4().simple().to_string();
        let spec = LaunchSpec {
            name: format!("asg-{}-{}", group.name, &suffix[..8]),
            image: group.image.clone(),
            // Host port is auto-assigned so members never collide.
            ports: format!("0:{port}"),
            vpc_id: Some(group.vpc_id),
            volumes: Vec::new(),
        };
        let instance = ctx.run(self.compute.launch_instance(ctx, spec)).await?;

        let member = GroupMember {
            group_id: group.id,
            instance_id: instance.id,
            joined_at: self.clock.now(),
        };
        self.repo.add_member(&member)?;
        members.push(member);

        if let Some(lb_id) = group.load_balancer_id {
            let registered = ctx
                .run(
                    self.load_balancer
                        .add_target(ctx, lb_id, instance.id, port, LB_TARGET_WEIGHT),
                )
                .await;
            if let Err(e) = registered {
                self.discard_member(ctx, group, members).await;
                return Err(e.into());
            }
        }

        debug!(group = %group.id, instance = %instance.id, "member launched");
        self.emit(ctx, group, "SCALE_OUT", instance.id).await;
        Ok(())
    }

    /// Undo a launch whose registration failed. Runs detached from the
    /// tick's cancellation so a shutdown cannot leave the member half added.
    async fn discard_member(
        &self,
        ctx: &OpContext,
        group: &ScalingGroup,
        members: &mut Vec<GroupMember>,
    ) {
        let Some(instance_id) = members.last().map(|m| m.instance_id) else {
            return;
        };
        if let Err(e) = self.repo.remove_member(group.id, instance_id) {
            error!(group = %group.id, instance = %instance_id, error = %e, "failed to untrack unregistered member");
            return;
        }
        members.pop();

        let cleanup = OpContext::new(*ctx.principal());
        if let Err(e) = ignore_not_found(
            self.compute
                .terminate_instance(&cleanup, instance_id)
                .await,
        ) {
            error!(group = %group.id, instance = %instance_id, error = %e, "unregistered instance left running");
        }
    }

    async fn scale_in(
        &self,
        ctx: &OpContext,
        group: &mut ScalingGroup,
        members: &mut Vec<GroupMember>,
        surplus: u32,
    ) -> GroupOutcome {
        info!(group = %group.id, current = members.len(), desired = group.desired_count, "scaling in");
        let mut terminated = 0;
        for _ in 0..surplus {
            match self.remove_member(ctx, group, members).await {
                Ok(()) => terminated += 1,
                Err(e) if e.is_cancelled() => {
                    self.record_progress(group, members);
                    return GroupOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(group = %group.id, error = %e, "scale-in failed");
                    self.record_failure(group, members);
                    return GroupOutcome::ScaledIn {
                        terminated,
                        failed: true,
                    };
                }
            }
        }
        self.record_success(group, members);
        GroupOutcome::ScaledIn {
            terminated,
            failed: false,
        }
    }

    /// Deregister, untrack and terminate the newest member. Anything
    /// already gone on the backend counts as done.
    async fn remove_member(
        &self,
        ctx: &OpContext,
        group: &ScalingGroup,
        members: &mut Vec<GroupMember>,
    ) -> Result<(), ScaleError> {
        let Some(instance_id) = members.last().map(|m| m.instance_id) else {
            return Ok(());
        };
        if let Some(lb_id) = group.load_balancer_id {
            ignore_not_found(
                ctx.run(self.load_balancer.remove_target(ctx, lb_id, instance_id))
                    .await,
            )?;
        }
        self.repo.remove_member(group.id, instance_id)?;
        members.pop();
        ignore_not_found(
            ctx.run(self.compute.terminate_instance(ctx, instance_id))
                .await,
        )?;

        debug!(group = %group.id, instance = %instance_id, "member terminated");
        self.emit(ctx, group, "SCALE_IN", instance_id).await;
        Ok(())
    }

    fn record_failure(&self, group: &mut ScalingGroup, members: &[GroupMember]) {
        let now = self.clock.now();
        group.current_count = members.len() as u32;
        group.failure_count = group.failure_count.saturating_add(1);
        group.last_failure_at = Some(now);
        group.updated_at = now;
        if let Err(e) = self.repo.update_group(group) {
            error!(group = %group.id, error = %e, "failed to persist group failure");
        }
    }

    fn record_success(&self, group: &mut ScalingGroup, members: &[GroupMember]) {
        group.current_count = members.len() as u32;
        group.failure_count = 0;
        group.updated_at = self.clock.now();
        self.persist_group(group, "scaling success");
    }

    /// Cancelled mid-reconcile: keep what was committed, count nothing.
    fn record_progress(&self, group: &mut ScalingGroup, members: &[GroupMember]) {
        group.current_count = members.len() as u32;
        group.updated_at = self.clock.now();
        self.persist_group(group, "partial progress");
    }

    fn persist_group(&self, group: &ScalingGroup, what: &'static str) {
        if let Err(e) = self.repo.update_group(group) {
            warn!(group = %group.id, what, error = %e, "failed to persist group");
        }
    }

    // ── Policy evaluation ─────────────────────────────────────────

    async fn evaluate_policies(
        &self,
        ctx: &OpContext,
        group: &mut ScalingGroup,
        members: &[GroupMember],
        policies: &mut [ScalingPolicy],
    ) -> GroupOutcome {
        let instances: Vec<Uuid> = members.iter().map(|m| m.instance_id).collect();
        let initial = group.desired_count;

        for policy in policies.iter_mut() {
            let now = self.clock.now();
            if policy.in_cooldown(now) {
                debug!(group = %group.id, policy = %policy.id, "policy in cooldown");
                continue;
            }

            let reading = match policy.metric_type {
                MetricType::Cpu => {
                    ctx.run(
                        self.metrics
                            .average_cpu(ctx, &instances, self.settings.metric_window),
                    )
                    .await
                }
            };
            let metric = match reading {
                Ok(value) => value,
                Err(e) if e.is_cancelled() => return GroupOutcome::Cancelled,
                Err(e) => {
                    warn!(group = %group.id, policy = %policy.id, error = %e, "metric read failed, skipping policy");
                    continue;
                }
            };

            if let ScaleDecision::ScaleTo(target) = decide(group, policy, metric) {
                self.apply_policy(group, policy, target, now);
            }
        }

        if group.desired_count == initial {
            GroupOutcome::Steady
        } else {
            GroupOutcome::PolicyAdjusted {
                from: initial,
                to: group.desired_count,
            }
        }
    }

    fn apply_policy(
        &self,
        group: &mut ScalingGroup,
        policy: &mut ScalingPolicy,
        target: u32,
        now: DateTime<Utc>,
    ) {
        info!(
            group = %group.id,
            policy = %policy.name,
            from = group.desired_count,
            to = target,
            "policy adjusted desired count"
        );
        group.desired_count = target;
        group.updated_at = now;
        policy.last_scaled_at = Some(now);
        self.persist_group(group, "desired count");
        if let Err(e) = self.repo.update_policy(policy) {
            warn!(policy = %policy.id, error = %e, "failed to persist policy");
        }
    }

    // ── Events ────────────────────────────────────────────────────

    /// Record a scaling event. Failures are logged and ignored.
    async fn emit(&self, ctx: &OpContext, group: &ScalingGroup, event_type: &str, instance_id: Uuid) {
        let event = EventRecord {
            event_type: event_type.to_string(),
            resource_id: group.id.to_string(),
            resource_type: RESOURCE_TYPE.to_string(),
            metadata: serde_json::json!({
                "group_name": group.name,
                "instance_id": instance_id.to_string(),
            }),
        };
        if let Err(e) = ctx.run(self.events.record_event(ctx, event)).await {
            warn!(group = %group.id, event_type, error = %e, "failed to record event");
        }
    }
}

fn ignore_not_found(result: thecloud_core::BackendResult<()>) -> Result<(), ScaleError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => Ok(other?),
    }
}
