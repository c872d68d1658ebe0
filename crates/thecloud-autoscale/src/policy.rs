//! Target-tracking policy decisions.
//!
//! A policy compares the group's average metric against its target and
//! steps the desired count by a fixed amount, clamped to the group bounds:
//!
//! ```text
//! metric > target  →  desired + scale_out_step  (≤ max_instances)
//! metric < target  →  desired - scale_in_step   (≥ min_instances)
//! otherwise        →  no change
//! ```

use thecloud_state::{ScalingGroup, ScalingPolicy};
use tracing::debug;

/// A scaling decision for one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Set the group's desired count.
    ScaleTo(u32),
    NoChange,
}

/// Decide what `policy` wants given the current `metric` reading.
///
/// Cooldown is checked by the caller; this only looks at the numbers.
pub fn decide(group: &ScalingGroup, policy: &ScalingPolicy, metric: f64) -> ScaleDecision {
    let desired = i64::from(group.desired_count);
    let proposed = if metric > policy.target_value {
        desired + i64::from(policy.scale_out_step)
    } else if metric < policy.target_value {
        desired - i64::from(policy.scale_in_step)
    } else {
        return ScaleDecision::NoChange;
    };

    let clamped = group.clamp_desired(proposed);
    if clamped == group.desired_count {
        return ScaleDecision::NoChange;
    }
    debug!(
        group = %group.id,
        policy = %policy.id,
        metric,
        target = policy.target_value,
        from = group.desired_count,
        to = clamped,
        "policy wants new desired count"
    );
    ScaleDecision::ScaleTo(clamped)
}
