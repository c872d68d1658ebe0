//! Domain records persisted by the TheCloud state store.
//!
//! Stacks and their resource bookkeeping are written by the provisioning
//! and rollback engines; scaling groups and policies are created by the
//! (external) CRUD services, and only their counters and timestamps are
//! mutated by the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use thecloud_core::ResourceType;

// ── Stack ─────────────────────────────────────────────────────────

/// Lifecycle status of a stack, as exposed to callers polling get/list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StackStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            StackStatus::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    /// Whether the engines will never touch a stack in this status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StackStatus::CreateComplete
                | StackStatus::CreateFailed
                | StackStatus::RollbackComplete
                | StackStatus::RollbackFailed
        )
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declarative provisioning request and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stack {
    pub id: Uuid,
    /// Owning tenant.
    pub owner: Uuid,
    pub name: String,
    /// Raw template text as submitted.
    pub template: String,
    /// Opaque caller-supplied parameters.
    pub parameters: BTreeMap<String, String>,
    pub status: StackStatus,
    pub status_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stack {
    /// A fresh stack in `CREATE_IN_PROGRESS`.
    pub fn new(
        owner: Uuid,
        name: &str,
        template: &str,
        parameters: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            name: name.to_string(),
            template: template.to_string(),
            parameters,
            status: StackStatus::CreateInProgress,
            status_reason: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: StackStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.status_reason = reason.into();
        self.updated_at = now;
    }

    /// First eight characters of the stack id, used to default resource names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn table_key(&self) -> String {
        self.id.to_string()
    }
}

/// Per-resource status recorded in stack bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    CreateInProgress,
    CreateComplete,
}

/// Bookkeeping row for one physical resource created by a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackResource {
    pub id: Uuid,
    pub stack_id: Uuid,
    /// Name of the resource in the template.
    pub logical_id: String,
    /// String form of the backend's identifier.
    pub physical_id: String,
    pub resource_type: ResourceType,
    pub status: ResourceStatus,
    pub created_at: DateTime<Utc>,
}

impl StackResource {
    pub fn new(
        stack_id: Uuid,
        logical_id: &str,
        physical_id: &str,
        resource_type: ResourceType,
        now: DateTime<Utc>,
    ) -> Self {
        // Snapshots finish asynchronously on the storage backend.
        let status = match resource_type {
            ResourceType::Snapshot => ResourceStatus::CreateInProgress,
            _ => ResourceStatus::CreateComplete,
        };
        Self {
            id: Uuid::new_v4(),
            stack_id,
            logical_id: logical_id.to_string(),
            physical_id: physical_id.to_string(),
            resource_type,
            status,
            created_at: now,
        }
    }
}

// ── Scaling ───────────────────────────────────────────────────────

/// A pool of instances kept at a desired size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingGroup {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub vpc_id: Uuid,
    pub load_balancer_id: Option<Uuid>,
    /// Image every member is launched from.
    pub image: String,
    /// Port spec of the instance template (`"80"` or `"8080:80"`).
    pub ports: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub desired_count: u32,
    /// Membership size observed by the last reconciliation.
    pub current_count: u32,
    /// Consecutive reconciliation failures.
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScalingGroup {
    pub fn table_key(&self) -> String {
        self.id.to_string()
    }

    /// Clamp a proposed desired count into `[min_instances, max_instances]`.
    pub fn clamp_desired(&self, proposed: i64) -> u32 {
        let lo = i64::from(self.min_instances);
        let hi = i64::from(self.max_instances.max(self.min_instances));
        proposed.clamp(lo, hi) as u32
    }

    /// Whether this group is in its failure backoff window at `now`.
    pub fn in_backoff(&self, now: DateTime<Utc>, threshold: u32, window: Duration) -> bool {
        match self.last_failure_at {
            Some(last) if self.failure_count >= threshold => last
                .checked_add_signed(window)
                .is_none_or(|until| now < until),
            _ => false,
        }
    }
}

/// Metrics a scaling policy can track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Cpu,
}

/// A target-tracking rule attached to a scaling group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub metric_type: MetricType,
    pub target_value: f64,
    pub scale_out_step: u32,
    pub scale_in_step: u32,
    pub cooldown_secs: u64,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl ScalingPolicy {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.group_id, self.id)
    }

    /// Whether the policy may not fire yet at `now`.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(self.cooldown_secs.min(u64::from(u32::MAX)) as i64);
        match self.last_scaled_at {
            Some(last) => last
                .checked_add_signed(cooldown)
                .is_none_or(|ready_at| now < ready_at),
            None => false,
        }
    }
}

/// An instance tracked as a member of a scaling group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub instance_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.group_id, self.instance_id)
    }
}

/// A scaling group together with its members and policies, as returned by
/// the reconciler's bulk fetch. Members are ordered oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingGroupSnapshot {
    pub group: ScalingGroup,
    pub members: Vec<GroupMember>,
    pub policies: Vec<ScalingPolicy>,
}

impl ScalingGroupSnapshot {
    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.instance_id).collect()
    }
}
