//! redb table definitions for the TheCloud state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Stacks keyed by `{stack_id}`.
pub const STACKS: TableDefinition<&str, &[u8]> = TableDefinition::new("stacks");

/// Stack resources keyed by `{stack_id}:{seq:010}`.
pub const STACK_RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("stack_resources");

/// Scaling groups keyed by `{group_id}`.
pub const SCALING_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling_groups");

/// Scaling policies keyed by `{group_id}:{policy_id}`.
pub const SCALING_POLICIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scaling_policies");

/// Group memberships keyed by `{group_id}:{instance_id}`.
pub const GROUP_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("group_instances");
