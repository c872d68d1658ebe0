//! Detached stack jobs: a bounded queue and the worker that drains it.
//!
//! The request path only persists a stack and enqueues a job. `StackWorker`
//! runs jobs concurrently up to `max_concurrent_jobs`, but never two jobs
//! for the same stack at once: a job waits for the previous job of its
//! stack to finish, so a teardown submitted during provisioning runs after
//! it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use thecloud_core::config::ProvisionerConfig;
use thecloud_state::Stack;

use crate::error::{StackError, StackResult};
use crate::provision::Provisioner;

/// Work for the stack worker. Each job carries its own copy of the stack.
#[derive(Debug, Clone)]
pub enum StackJob {
    Provision(Stack),
    Teardown(Stack),
}

impl StackJob {
    pub fn stack_id(&self) -> Uuid {
        match self {
            StackJob::Provision(stack) | StackJob::Teardown(stack) => stack.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StackJob::Provision(_) => "provision",
            StackJob::Teardown(_) => "teardown",
        }
    }
}

/// Submitting side of the job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<StackJob>,
}

impl JobQueue {
    /// Enqueue without waiting. Fails when the queue is full or the worker
    /// has stopped.
    pub fn submit(&self, job: StackJob) -> StackResult<()> {
        let stack_id = job.stack_id();
        let kind = job.kind();
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => StackError::QueueFull,
            TrySendError::Closed(_) => StackError::QueueClosed,
        })?;
        debug!(stack_id = %stack_id, kind, "stack job queued");
        Ok(())
    }
}

/// Create a queue and the worker that consumes it.
pub fn job_queue(provisioner: Arc<Provisioner>, config: &ProvisionerConfig) -> (JobQueue, StackWorker) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let worker = StackWorker {
        rx,
        provisioner,
        max_concurrent: config.max_concurrent_jobs.max(1),
    };
    (JobQueue { tx }, worker)
}

pub struct StackWorker {
    rx: mpsc::Receiver<StackJob>,
    provisioner: Arc<Provisioner>,
    max_concurrent: usize,
}

impl StackWorker {
    /// Run until every `JobQueue` handle is dropped or shutdown is signalled.
    ///
    /// On shutdown in-flight jobs are cancelled (they stop without rollback)
    /// and jobs still queued are discarded. Either way, returns only after
    /// every started job has finished.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(max_concurrent = self.max_concurrent, "stack worker started");

        let cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut in_flight: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                job = self.rx.recv() => {
                    let Some(job) = job else {
                        debug!("stack job queue closed");
                        break;
                    };
                    in_flight.retain(|_, handle| !handle.is_finished());

                    let stack_id = job.stack_id();
                    let previous = in_flight.remove(&stack_id);
                    let handle = tokio::spawn(run_job(
                        self.provisioner.clone(),
                        job,
                        previous,
                        permits.clone(),
                        cancel.child_token(),
                    ));
                    in_flight.insert(stack_id, handle);
                }
                _ = shutdown.changed() => {
                    info!(in_flight = in_flight.len(), "stack worker shutting down");
                    cancel.cancel();
                    self.rx.close();
                    break;
                }
            }
        }

        for (stack_id, handle) in in_flight {
            if let Err(e) = handle.await {
                warn!(stack_id = %stack_id, error = %e, "stack job panicked");
            }
        }
        info!("stack worker stopped");
    }
}

async fn run_job(
    provisioner: Arc<Provisioner>,
    job: StackJob,
    previous: Option<JoinHandle<()>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    // At most one job per stack: wait for the earlier one.
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };

    let stack_id = job.stack_id();
    match job {
        StackJob::Provision(stack) => {
            let outcome = provisioner.provision(stack, &cancel).await;
            debug!(stack_id = %stack_id, ?outcome, "provision job finished");
        }
        StackJob::Teardown(stack) => {
            let outcome = provisioner.teardown(&stack, &cancel).await;
            debug!(stack_id = %stack_id, ?outcome, "teardown job finished");
        }
    }
}
