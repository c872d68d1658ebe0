//! Repository seams between the engines and persistence.
//!
//! `StateStore` is the production implementation. The traits are
//! object-safe so engines hold `Arc<dyn StackRepository>` /
//! `Arc<dyn ScalingRepository>` and tests can wrap a store with one that
//! fails selected operations.

use uuid::Uuid;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

/// Persistence used by the stack provisioning, rollback and teardown paths.
pub trait StackRepository: Send + Sync {
    /// Insert or overwrite a stack row.
    fn save_stack(&self, stack: &Stack) -> StateResult<()>;

    fn get_stack(&self, id: Uuid) -> StateResult<Option<Stack>>;

    fn list_stacks_for_owner(&self, owner: Uuid) -> StateResult<Vec<Stack>>;

    /// Delete the stack row and every resource row it owns.
    fn delete_stack(&self, id: Uuid) -> StateResult<bool>;

    /// Append a bookkeeping row after the stack's existing rows.
    fn add_resource(&self, resource: &StackResource) -> StateResult<()>;

    /// Bookkeeping rows in creation order.
    fn list_resources(&self, stack_id: Uuid) -> StateResult<Vec<StackResource>>;

    fn delete_resources(&self, stack_id: Uuid) -> StateResult<u32>;
}

/// Persistence used by the autoscaling reconciler.
pub trait ScalingRepository: Send + Sync {
    /// All groups with members and policies, from one consistent read.
    fn list_group_snapshots(&self) -> StateResult<Vec<ScalingGroupSnapshot>>;

    /// Overwrite a group's row (counters, failure tracking, desired count).
    fn update_group(&self, group: &ScalingGroup) -> StateResult<()>;

    fn update_policy(&self, policy: &ScalingPolicy) -> StateResult<()>;

    fn add_member(&self, member: &GroupMember) -> StateResult<()>;

    fn remove_member(&self, group_id: Uuid, instance_id: Uuid) -> StateResult<bool>;
}

impl StackRepository for StateStore {
    fn save_stack(&self, stack: &Stack) -> StateResult<()> {
        self.put_stack(stack)
    }

    fn get_stack(&self, id: Uuid) -> StateResult<Option<Stack>> {
        StateStore::get_stack(self, id)
    }

    fn list_stacks_for_owner(&self, owner: Uuid) -> StateResult<Vec<Stack>> {
        self.list_stacks(Some(owner))
    }

    fn delete_stack(&self, id: Uuid) -> StateResult<bool> {
        StateStore::delete_stack(self, id)
    }

    fn add_resource(&self, resource: &StackResource) -> StateResult<()> {
        self.append_stack_resource(resource)
    }

    fn list_resources(&self, stack_id: Uuid) -> StateResult<Vec<StackResource>> {
        self.list_stack_resources(stack_id)
    }

    fn delete_resources(&self, stack_id: Uuid) -> StateResult<u32> {
        self.delete_stack_resources(stack_id)
    }
}

impl ScalingRepository for StateStore {
    fn list_group_snapshots(&self) -> StateResult<Vec<ScalingGroupSnapshot>> {
        self.list_scaling_group_snapshots()
    }

    fn update_group(&self, group: &ScalingGroup) -> StateResult<()> {
        self.put_scaling_group(group)
    }

    fn update_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put_scaling_policy(policy)
    }

    fn add_member(&self, member: &GroupMember) -> StateResult<()> {
        self.add_group_member(member)
    }

    fn remove_member(&self, group_id: Uuid, instance_id: Uuid) -> StateResult<bool> {
        self.remove_group_member(group_id, instance_id)
    }
}
