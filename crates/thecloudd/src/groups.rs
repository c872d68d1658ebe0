//! Scaling-group operator commands.
//!
//! Groups are described in a TOML file:
//!
//! ```toml
//! owner = "6f1c1c51-6a5e-4a43-9a43-1d5c3a8c0001"
//! name = "web"
//! vpc_id = "0b7c6a3e-2a49-4f0e-9a55-8d1f1c0d2e11"
//! load_balancer_id = "4d2f3c1b-7e8a-4b6c-9d0e-1f2a3b4c5d6e"   # optional
//! image = "nginx:latest"
//! ports = "8080:80"
//! min_instances = 1
//! max_instances = 4
//! desired_count = 2
//!
//! [[policies]]
//! name = "cpu"
//! target_value = 70.0
//! cooldown_secs = 300
//! ```
//!
//! `put` creates the group, or updates it when `id` names an existing one.
//! Policies are matched by name; policies missing from the file are kept.

use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::json;
use thecloud_core::{Clock, CloudConfig, SystemClock, container_port};
use thecloud_state::{MetricType, ScalingGroup, ScalingPolicy, StateStore};
use tracing::info;
use uuid::Uuid;

use crate::commands::print_json;
use crate::platform::open_store;

/// A scaling group as written by an operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupFile {
    pub id: Option<Uuid>,
    pub owner: Uuid,
    pub name: String,
    pub vpc_id: Uuid,
    pub load_balancer_id: Option<Uuid>,
    pub image: String,
    #[serde(default = "default_ports")]
    pub ports: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub desired_count: u32,
    #[serde(default)]
    pub policies: Vec<PolicyFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    pub name: String,
    #[serde(default = "default_metric")]
    pub metric_type: MetricType,
    pub target_value: f64,
    #[serde(default = "default_step")]
    pub scale_out_step: u32,
    #[serde(default = "default_step")]
    pub scale_in_step: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_ports() -> String {
    "80".to_string()
}

fn default_metric() -> MetricType {
    MetricType::Cpu
}

fn default_step() -> u32 {
    1
}

fn default_cooldown() -> u64 {
    300
}

impl GroupFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading group file {}", path.display()))?;
        let file: GroupFile = toml::from_str(&content)
            .with_context(|| format!("parsing group file {}", path.display()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.owner.is_nil() {
            bail!("owner must be a user id");
        }
        if self.name.trim().is_empty() {
            bail!("name must not be empty");
        }
        if self.image.trim().is_empty() {
            bail!("image must not be empty");
        }
        if container_port(&self.ports).is_none() {
            bail!("ports {:?} has no container port", self.ports);
        }
        if self.min_instances > self.max_instances {
            bail!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances,
                self.max_instances
            );
        }
        if !(self.min_instances..=self.max_instances).contains(&self.desired_count) {
            bail!(
                "desired_count ({}) is outside [{}, {}]",
                self.desired_count,
                self.min_instances,
                self.max_instances
            );
        }
        for policy in &self.policies {
            if policy.name.trim().is_empty() {
                bail!("policy name must not be empty");
            }
            if !policy.target_value.is_finite() {
                bail!("policy {}: target_value must be a number", policy.name);
            }
            if policy.scale_out_step == 0 || policy.scale_in_step == 0 {
                bail!("policy {}: steps must be at least 1", policy.name);
            }
        }
        if let Some(dup) = self
            .policies
            .iter()
            .enumerate()
            .find(|(i, p)| self.policies[..*i].iter().any(|q| q.name == p.name))
            .map(|(_, p)| &p.name)
        {
            bail!("policy {dup} is declared twice");
        }
        Ok(())
    }
}

/// Create or update a group and its policies from `file`. Reconciliation
/// state of an existing group (counters, failures, members) is preserved.
pub fn put_group(
    store: &StateStore,
    clock: &dyn Clock,
    file: GroupFile,
) -> anyhow::Result<(ScalingGroup, Vec<ScalingPolicy>)> {
    let now = clock.now();
    let existing = match file.id {
        Some(id) => store.get_scaling_group(id)?,
        None => None,
    };
    if let Some(existing) = &existing
        && existing.owner != file.owner
    {
        bail!("scaling group {} belongs to another owner", existing.id);
    }

    let group = ScalingGroup {
        id: file.id.unwrap_or_else(Uuid::new_v4),
        owner: file.owner,
        name: file.name,
        vpc_id: file.vpc_id,
        load_balancer_id: file.load_balancer_id,
        image: file.image,
        ports: file.ports,
        min_instances: file.min_instances,
        max_instances: file.max_instances,
        desired_count: file.desired_count,
        current_count: existing.as_ref().map_or(0, |g| g.current_count),
        failure_count: existing.as_ref().map_or(0, |g| g.failure_count),
        last_failure_at: existing.as_ref().and_then(|g| g.last_failure_at),
        created_at: existing.as_ref().map_or(now, |g| g.created_at),
        updated_at: now,
    };
    store.put_scaling_group(&group)?;

    let current = store.list_policies_for_group(group.id)?;
    let mut policies = Vec::with_capacity(file.policies.len());
    for spec in file.policies {
        let previous = current.iter().find(|p| p.name == spec.name);
        let policy = ScalingPolicy {
            id: previous.map_or_else(Uuid::new_v4, |p| p.id),
            group_id: group.id,
            name: spec.name,
            metric_type: spec.metric_type,
            target_value: spec.target_value,
            scale_out_step: spec.scale_out_step,
            scale_in_step: spec.scale_in_step,
            cooldown_secs: spec.cooldown_secs,
            last_scaled_at: previous.and_then(|p| p.last_scaled_at),
        };
        store.put_scaling_policy(&policy)?;
        policies.push(policy);
    }

    info!(
        group = %group.id,
        name = %group.name,
        created = existing.is_none(),
        policies = policies.len(),
        "scaling group saved"
    );
    Ok((group, policies))
}

pub fn put(config: &CloudConfig, path: &Path) -> anyhow::Result<()> {
    let file = GroupFile::from_file(path)?;
    let store = open_store(config)?;
    let (group, policies) = put_group(&store, &SystemClock, file)?;
    print_json(&json!({ "group": group, "policies": policies }))
}

pub fn list(config: &CloudConfig, owner: Option<Uuid>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let groups: Vec<_> = store
        .list_scaling_group_snapshots()?
        .into_iter()
        .filter(|s| owner.is_none_or(|o| s.group.owner == o))
        .map(|s| {
            json!({
                "group": s.group,
                "members": s.instance_ids(),
                "policies": s.policies,
            })
        })
        .collect();
    print_json(&groups)
}

pub fn delete(config: &CloudConfig, owner: Uuid, id: Uuid) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match store.get_scaling_group(id)? {
        Some(group) if group.owner == owner => {}
        _ => bail!("scaling group {id} not found"),
    }
    store.delete_scaling_group(id)?;
    info!(group = %id, "scaling group deleted");
    print_json(&json!({ "deleted": id }))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use thecloud_core::ManualClock;

    use super::*;

    const GROUP: &str = r#"
owner = "6f1c1c51-6a5e-4a43-9a43-1d5c3a8c0001"
name = "web"
vpc_id = "0b7c6a3e-2a49-4f0e-9a55-8d1f1c0d2e11"
load_balancer_id = "4d2f3c1b-7e8a-4b6c-9d0e-1f2a3b4c5d6e"
image = "nginx:latest"
ports = "8080:80"
min_instances = 1
max_instances = 4
desired_count = 2

[[policies]]
name = "cpu"
target_value = 70.0
cooldown_secs = 60
"#;

    fn parse(text: &str) -> anyhow::Result<GroupFile> {
        let file: GroupFile = toml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    #[test]
    fn group_file_defaults() {
        let file = parse(GROUP).unwrap();
        assert_eq!(file.id, None);
        assert_eq!(file.policies.len(), 1);
        let policy = &file.policies[0];
        assert_eq!(policy.metric_type, MetricType::Cpu);
        assert_eq!(policy.scale_out_step, 1);
        assert_eq!(policy.scale_in_step, 1);
        assert_eq!(policy.cooldown_secs, 60);
    }

    #[test]
    fn group_file_rejects_bad_bounds() {
        let err = parse(&GROUP.replace("desired_count = 2", "desired_count = 9")).unwrap_err();
        assert!(err.to_string().contains("desired_count"));

        let err = parse(&GROUP.replace("min_instances = 1", "min_instances = 5")).unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        let err = parse(&GROUP.replace("ports = \"8080:80\"", "ports = \"web\"")).unwrap_err();
        assert!(err.to_string().contains("container port"));

        let twice = format!("{GROUP}\n[[policies]]\nname = \"cpu\"\ntarget_value = 50.0\n");
        assert!(parse(&twice).unwrap_err().to_string().contains("twice"));

        assert!(parse(&format!("{GROUP}\ncolour = \"blue\"\n")).is_err());
    }

    #[test]
    fn put_creates_group_and_policies() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc::now());

        let (group, policies) = put_group(&store, &clock, parse(GROUP).unwrap()).unwrap();
        assert_eq!(group.desired_count, 2);
        assert_eq!(group.current_count, 0);
        assert_eq!(group.created_at, clock.now());

        let stored = store.get_scaling_group(group.id).unwrap().unwrap();
        assert_eq!(stored, group);
        assert_eq!(store.list_policies_for_group(group.id).unwrap(), policies);
    }

    #[test]
    fn put_updates_in_place_and_keeps_reconcile_state() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc::now());
        let (mut group, policies) = put_group(&store, &clock, parse(GROUP).unwrap()).unwrap();

        group.current_count = 2;
        group.failure_count = 3;
        group.last_failure_at = Some(clock.now());
        store.put_scaling_group(&group).unwrap();
        let mut policy = policies[0].clone();
        policy.last_scaled_at = Some(clock.now());
        store.put_scaling_policy(&policy).unwrap();

        clock.advance(Duration::minutes(1));
        let updated = format!("id = \"{}\"\n{}", group.id, GROUP.replace("max_instances = 4", "max_instances = 8"));
        let (saved, saved_policies) = put_group(&store, &clock, parse(&updated).unwrap()).unwrap();

        assert_eq!(saved.id, group.id);
        assert_eq!(saved.max_instances, 8);
        assert_eq!(saved.current_count, 2);
        assert_eq!(saved.failure_count, 3);
        assert_eq!(saved.created_at, group.created_at);
        assert_eq!(saved.updated_at, clock.now());
        assert_eq!(saved_policies[0].id, policy.id);
        assert_eq!(saved_policies[0].last_scaled_at, policy.last_scaled_at);
        assert_eq!(store.list_scaling_groups().unwrap().len(), 1);
        assert_eq!(store.list_policies_for_group(group.id).unwrap().len(), 1);
    }

    #[test]
    fn put_refuses_another_owners_group() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc::now());
        let (group, _) = put_group(&store, &clock, parse(GROUP).unwrap()).unwrap();

        let other = Uuid::new_v4();
        let stolen = format!("id = \"{}\"\n{}", group.id, GROUP)
            .replace("6f1c1c51-6a5e-4a43-9a43-1d5c3a8c0001", &other.to_string());
        assert!(put_group(&store, &clock, parse(&stolen).unwrap()).is_err());
        assert_eq!(store.get_scaling_group(group.id).unwrap().unwrap().owner, group.owner);
    }

    #[test]
    fn delete_checks_owner_and_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CloudConfig::default();
        config.state.data_dir = dir.path().join("state");

        let group_id = {
            let store = open_store(&config).unwrap();
            let (group, _) = put_group(&store, &SystemClock, parse(GROUP).unwrap()).unwrap();
            group.id
        };
        let owner: Uuid = "6f1c1c51-6a5e-4a43-9a43-1d5c3a8c0001".parse().unwrap();

        assert!(delete(&config, Uuid::new_v4(), group_id).is_err());
        delete(&config, owner, group_id).unwrap();

        let store = open_store(&config).unwrap();
        assert!(store.get_scaling_group(group_id).unwrap().is_none());
        assert!(store.list_policies_for_group(group_id).unwrap().is_empty());
    }
}
