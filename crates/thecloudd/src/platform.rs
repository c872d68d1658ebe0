//! Wiring shared by the daemon and the one-shot commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use thecloud_autoscale::{Reconciler, ReconcilerSettings};
use thecloud_core::{Clock, CloudConfig, Principal, SystemClock};
use thecloud_sim::SimCloud;
use thecloud_stack::{Provisioner, StackError, StackService, StackWorker, job_queue};
use thecloud_state::{Stack, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub const STATE_FILE: &str = "thecloud.redb";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Every subsystem, opened against one data directory.
pub struct Platform {
    pub store: Arc<StateStore>,
    pub cloud: Arc<SimCloud>,
    pub service: StackService,
    pub reconciler: Reconciler,
}

impl Platform {
    /// Open the state store and assemble the engines. The stack worker is
    /// returned separately so the caller decides where it runs.
    pub fn open(config: &CloudConfig) -> anyhow::Result<(Self, StackWorker)> {
        let store = Arc::new(open_store(config)?);

        let cloud = SimCloud::new();
        seed_scaling_groups(&store, &cloud)?;
        let backends = cloud.backends();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let provisioner = Arc::new(Provisioner::new(store.clone(), &backends, clock.clone()));
        let (queue, worker) = job_queue(provisioner, &config.provisioner);
        let service = StackService::new(store.clone(), queue, clock.clone());

        let settings = ReconcilerSettings::from_config(&config.reconciler)?;
        let reconciler = Reconciler::new(store.clone(), &backends, clock, settings);

        Ok((
            Self {
                store,
                cloud,
                service,
                reconciler,
            },
            worker,
        ))
    }

    /// Poll until the stack reaches a terminal status, or fail after `timeout`.
    pub async fn wait_settled(
        &self,
        principal: &Principal,
        id: Uuid,
        timeout: Duration,
    ) -> anyhow::Result<Stack> {
        let poll = async {
            loop {
                let stack = self.service.get_stack(principal, id)?;
                if stack.status.is_terminal() {
                    return anyhow::Ok(stack);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| anyhow!("stack {id} did not settle within {}s", timeout.as_secs()))?
    }

    /// Poll until the stack row is gone, or fail after `timeout`.
    ///
    /// A teardown that aborts or is cancelled keeps the row, so without a
    /// deadline this would never return.
    pub async fn wait_deleted(
        &self,
        principal: &Principal,
        id: Uuid,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let poll = async {
            loop {
                match self.service.get_stack(principal, id) {
                    Err(StackError::NotFound(_)) => return anyhow::Ok(()),
                    Err(e) => return Err(e.into()),
                    Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            anyhow!(
                "stack {id} still exists after {}s; teardown may have aborted, check the daemon logs",
                timeout.as_secs()
            )
        })?
    }
}

/// Open the state store under the configured data directory, creating
/// the directory if needed.
pub fn open_store(config: &CloudConfig) -> anyhow::Result<StateStore> {
    let data_dir = &config.state.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join(STATE_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

/// The simulator starts empty, so register every stored group's VPC and
/// load balancer under the group owner before the reconciler runs.
fn seed_scaling_groups(store: &StateStore, cloud: &SimCloud) -> anyhow::Result<()> {
    let groups = store.list_scaling_groups()?;
    for group in &groups {
        let owner = Principal::new(group.owner);
        cloud.adopt_vpc(&owner, group.vpc_id, &format!("{}-vpc", group.name));
        if let Some(lb_id) = group.load_balancer_id {
            cloud.adopt_load_balancer(&owner, lb_id);
        }
    }
    debug!(groups = groups.len(), "scaling groups registered with simulator");
    Ok(())
}

/// A stack worker running on its own task.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(worker: StackWorker) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(rx));
        Self { shutdown, task }
    }

    /// Signal shutdown and wait for in-flight jobs to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
