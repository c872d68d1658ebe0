//! StateStore: redb-backed state persistence for TheCloud.
//!
//! Provides typed CRUD over stacks, stack resources, scaling groups,
//! scaling policies and group memberships. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError::Storage` tagged with the operation.
macro_rules! storage {
    ($op:expr) => {
        |e| StateError::Storage {
            op: $op,
            message: e.to_string(),
        }
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(table: &'static str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Decode {
        table,
        message: e.to_string(),
    })
}

/// Collect every value under `prefix` from an open table, in key order.
fn scan_prefix<T, R>(table: &R, label: &'static str, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(storage!("scan"))? {
        let (key, value) = entry.map_err(storage!("scan"))?;
        if key.value().starts_with(prefix) {
            results.push(decode(label, value.value())?);
        }
    }
    Ok(results)
}

/// Remove every key under `prefix`. Returns the number removed.
fn remove_prefix(txn: &WriteTransaction, def: JsonTable, prefix: &str) -> StateResult<u32> {
    let mut table = txn.open_table(def).map_err(storage!("open table"))?;
    let keys: Vec<String> = table
        .iter()
        .map_err(storage!("scan"))?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            let k = key.value().to_string();
            k.starts_with(prefix).then_some(k)
        })
        .collect();
    for key in &keys {
        table.remove(key.as_str()).map_err(storage!("remove"))?;
    }
    Ok(keys.len() as u32)
}

/// Sequence number following the stack resource row `key`.
fn next_sequence(prefix: &str, key: &str) -> StateResult<u64> {
    key.strip_prefix(prefix)
        .and_then(|seq| seq.parse::<u64>().ok())
        .map(|seq| seq + 1)
        .ok_or_else(|| StateError::Decode {
            table: "stack_resources",
            message: format!("malformed row key {key:?}"),
        })
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.write("ensure tables", |txn| {
            // Opening a table in a write transaction creates it if absent.
            for def in [STACKS, STACK_RESOURCES, SCALING_GROUPS, SCALING_POLICIES, GROUP_INSTANCES] {
                txn.open_table(def).map_err(storage!("open table"))?;
            }
            Ok(())
        })
    }

    /// Run `f` inside a write transaction, committing only if it succeeds.
    fn write<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&WriteTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(storage!(op))?;
        let out = f(&txn)?;
        txn.commit().map_err(storage!(op))?;
        Ok(out)
    }

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        self.write("put", |txn| {
            let mut table = txn.open_table(def).map_err(storage!("open table"))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(storage!("insert"))?;
            Ok(())
        })
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        label: &'static str,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(storage!("begin read"))?;
        let table = txn.open_table(def).map_err(storage!("open table"))?;
        match table.get(key).map_err(storage!("get"))? {
            Some(guard) => Ok(Some(decode(label, guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        label: &'static str,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(storage!("begin read"))?;
        let table = txn.open_table(def).map_err(storage!("open table"))?;
        scan_prefix(&table, label, prefix)
    }

    // ── Stacks ─────────────────────────────────────────────────────

    /// Insert or update a stack.
    pub fn put_stack(&self, stack: &Stack) -> StateResult<()> {
        self.put_json(STACKS, &stack.table_key(), stack)?;
        debug!(stack_id = %stack.id, status = %stack.status, "stack stored");
        Ok(())
    }

    pub fn get_stack(&self, id: Uuid) -> StateResult<Option<Stack>> {
        self.get_json(STACKS, "stacks", &id.to_string())
    }

    /// List stacks, newest first, optionally restricted to one owner.
    pub fn list_stacks(&self, owner: Option<Uuid>) -> StateResult<Vec<Stack>> {
        let mut stacks: Vec<Stack> = self.list_json(STACKS, "stacks", "")?;
        if let Some(owner) = owner {
            stacks.retain(|s| s.owner == owner);
        }
        stacks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(stacks)
    }

    /// Delete a stack and all of its resource rows. Returns true if the stack existed.
    pub fn delete_stack(&self, id: Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let (existed, resources) = self.write("delete stack", |txn| {
            let existed = {
                let mut table = txn.open_table(STACKS).map_err(storage!("open table"))?;
                table.remove(key.as_str()).map_err(storage!("remove"))?.is_some()
            };
            let resources = remove_prefix(txn, STACK_RESOURCES, &format!("{key}:"))?;
            Ok((existed, resources))
        })?;
        debug!(stack_id = %id, existed, resources, "stack deleted");
        Ok(existed)
    }

    // ── Stack resources ────────────────────────────────────────────

    /// Append a resource row after the stack's existing rows.
    pub fn append_stack_resource(&self, resource: &StackResource) -> StateResult<()> {
        let bytes = encode(resource)?;
        let prefix = format!("{}:", resource.stack_id);
        let key = self.write("append stack resource", |txn| {
            let mut table = txn
                .open_table(STACK_RESOURCES)
                .map_err(storage!("open table"))?;
            // ';' sorts right after ':', so this range holds exactly the stack's rows.
            let end = format!("{};", resource.stack_id);
            let next_seq = {
                let last = table
                    .range(prefix.as_str()..end.as_str())
                    .map_err(storage!("range"))?
                    .next_back()
                    .transpose()
                    .map_err(storage!("range"))?;
                match last {
                    Some((key, _)) => next_sequence(&prefix, key.value())?,
                    None => 0,
                }
            };
            let key = format!("{prefix}{next_seq:010}");
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(storage!("insert"))?;
            Ok(key)
        })?;
        debug!(%key, logical_id = %resource.logical_id, "stack resource recorded");
        Ok(())
    }

    /// List a stack's resource rows in creation order.
    pub fn list_stack_resources(&self, stack_id: Uuid) -> StateResult<Vec<StackResource>> {
        self.list_json(STACK_RESOURCES, "stack_resources", &format!("{stack_id}:"))
    }

    /// Delete all resource rows of a stack. Returns the number deleted.
    pub fn delete_stack_resources(&self, stack_id: Uuid) -> StateResult<u32> {
        let prefix = format!("{stack_id}:");
        self.write("delete stack resources", |txn| {
            remove_prefix(txn, STACK_RESOURCES, &prefix)
        })
    }

    // ── Scaling groups ─────────────────────────────────────────────

    /// Insert or update a scaling group.
    pub fn put_scaling_group(&self, group: &ScalingGroup) -> StateResult<()> {
        self.put_json(SCALING_GROUPS, &group.table_key(), group)
    }

    pub fn get_scaling_group(&self, id: Uuid) -> StateResult<Option<ScalingGroup>> {
        self.get_json(SCALING_GROUPS, "scaling_groups", &id.to_string())
    }

    pub fn list_scaling_groups(&self) -> StateResult<Vec<ScalingGroup>> {
        self.list_json(SCALING_GROUPS, "scaling_groups", "")
    }

    /// Delete a group with its policies and memberships. Returns true if it existed.
    pub fn delete_scaling_group(&self, id: Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let existed = self.write("delete scaling group", |txn| {
            let existed = {
                let mut table = txn
                    .open_table(SCALING_GROUPS)
                    .map_err(storage!("open table"))?;
                table.remove(key.as_str()).map_err(storage!("remove"))?.is_some()
            };
            remove_prefix(txn, SCALING_POLICIES, &format!("{key}:"))?;
            remove_prefix(txn, GROUP_INSTANCES, &format!("{key}:"))?;
            Ok(existed)
        })?;
        debug!(group = %id, existed, "scaling group deleted");
        Ok(existed)
    }

    // ── Scaling policies ───────────────────────────────────────────

    /// Insert or update a scaling policy.
    pub fn put_scaling_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put_json(SCALING_POLICIES, &policy.table_key(), policy)
    }

    pub fn list_policies_for_group(&self, group_id: Uuid) -> StateResult<Vec<ScalingPolicy>> {
        self.list_json(SCALING_POLICIES, "scaling_policies", &format!("{group_id}:"))
    }

    // ── Group membership ───────────────────────────────────────────

    pub fn add_group_member(&self, member: &GroupMember) -> StateResult<()> {
        self.put_json(GROUP_INSTANCES, &member.table_key(), member)
    }

    /// Drop an instance from a group. Returns true if it was a member.
    pub fn remove_group_member(&self, group_id: Uuid, instance_id: Uuid) -> StateResult<bool> {
        let key = format!("{group_id}:{instance_id}");
        self.write("remove group member", |txn| {
            let mut table = txn
                .open_table(GROUP_INSTANCES)
                .map_err(storage!("open table"))?;
            Ok(table.remove(key.as_str()).map_err(storage!("remove"))?.is_some())
        })
    }

    pub fn list_group_members(&self, group_id: Uuid) -> StateResult<Vec<GroupMember>> {
        self.list_json(GROUP_INSTANCES, "group_instances", &format!("{group_id}:"))
    }

    /// Every scaling group with its members and policies, read in a single
    /// transaction so the reconciler sees one consistent snapshot.
    pub fn list_scaling_group_snapshots(&self) -> StateResult<Vec<ScalingGroupSnapshot>> {
        let txn = self.db.begin_read().map_err(storage!("begin read"))?;
        let groups_table = txn
            .open_table(SCALING_GROUPS)
            .map_err(storage!("open table"))?;
        let policies_table = txn
            .open_table(SCALING_POLICIES)
            .map_err(storage!("open table"))?;
        let members_table = txn
            .open_table(GROUP_INSTANCES)
            .map_err(storage!("open table"))?;

        let mut groups: Vec<ScalingGroup> = scan_prefix(&groups_table, "scaling_groups", "")?;
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut snapshots = Vec::with_capacity(groups.len());
        for group in groups {
            let prefix = format!("{}:", group.id);
            let mut members: Vec<GroupMember> =
                scan_prefix(&members_table, "group_instances", &prefix)?;
            members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.instance_id.cmp(&b.instance_id)));
            let policies = scan_prefix(&policies_table, "scaling_policies", &prefix)?;
            snapshots.push(ScalingGroupSnapshot {
                group,
                members,
                policies,
            });
        }
        Ok(snapshots)
    }
}
