//! One-shot operator commands. Each prints JSON on stdout.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::json;
use thecloud_core::{CloudConfig, Principal};
use thecloud_state::StackStatus;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::platform::{Platform, WorkerHandle};

pub async fn apply(
    config: &CloudConfig,
    owner: Uuid,
    name: &str,
    template: &Path,
    params: &[String],
    timeout: Duration,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(template)
        .with_context(|| format!("reading template {}", template.display()))?;
    let parameters = parse_params(params)?;
    let principal = Principal::new(owner);

    let (platform, worker) = Platform::open(config)?;
    let worker = WorkerHandle::spawn(worker);

    let created = platform
        .service
        .create_stack(&principal, name, &text, parameters)?;
    let settled = platform.wait_settled(&principal, created.id, timeout).await;
    worker.stop().await;
    let stack = settled?;
    let resources = platform.service.list_stack_resources(&principal, stack.id)?;

    print_json(&json!({ "stack": stack, "resources": resources }))?;
    if stack.status != StackStatus::CreateComplete {
        bail!("stack {} ended in {}: {}", stack.id, stack.status.as_str(), stack.status_reason);
    }
    Ok(())
}

pub fn stacks(config: &CloudConfig, owner: Uuid, stack: Option<Uuid>) -> anyhow::Result<()> {
    let principal = Principal::new(owner);
    let (platform, _worker) = Platform::open(config)?;

    match stack {
        Some(id) => {
            let stack = platform.service.get_stack(&principal, id)?;
            let resources = platform.service.list_stack_resources(&principal, id)?;
            print_json(&json!({ "stack": stack, "resources": resources }))
        }
        None => print_json(&platform.service.list_stacks(&principal)?),
    }
}

pub async fn destroy(
    config: &CloudConfig,
    owner: Uuid,
    stack: Uuid,
    timeout: Duration,
) -> anyhow::Result<()> {
    let principal = Principal::new(owner);
    let (platform, worker) = Platform::open(config)?;
    let worker = WorkerHandle::spawn(worker);

    platform.service.delete_stack(&principal, stack)?;
    let deleted = platform.wait_deleted(&principal, stack, timeout).await;
    worker.stop().await;
    deleted?;

    print_json(&json!({ "deleted": stack }))
}

pub fn validate(template: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(template)
        .with_context(|| format!("reading template {}", template.display()))?;
    let validation = thecloud_template::validate(&text);
    print_json(&validation)?;
    if !validation.valid {
        bail!("template {} is invalid", template.display());
    }
    Ok(())
}

pub async fn reconcile(config: &CloudConfig) -> anyhow::Result<()> {
    let (platform, _worker) = Platform::open(config)?;
    let report = platform.reconciler.tick(&CancellationToken::new()).await?;

    let groups: Vec<_> = report
        .groups
        .iter()
        .map(|(id, outcome)| json!({ "group_id": id, "outcome": format!("{outcome:?}") }))
        .collect();
    print_json(&json!({ "groups": groups }))
}

fn parse_params(params: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    params
        .iter()
        .map(|param| match param.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("parameter {param:?} is not KEY=VALUE"),
        })
        .collect()
}

pub(crate) fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
