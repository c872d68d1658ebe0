//! Tenant-facing stack operations.
//!
//! Entry points validate the caller and ownership, touch the repository,
//! and hand long-running work to the job queue. Provisioning and teardown
//! outcomes are only observable by polling `get_stack` / `list_stacks`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use thecloud_core::{Clock, Principal};
use thecloud_state::{Stack, StackRepository, StackResource, StackStatus};
use thecloud_template::TemplateValidation;

use crate::error::{StackError, StackResult};
use crate::worker::{JobQueue, StackJob};

pub struct StackService {
    repo: Arc<dyn StackRepository>,
    queue: JobQueue,
    clock: Arc<dyn Clock>,
}

impl StackService {
    pub fn new(repo: Arc<dyn StackRepository>, queue: JobQueue, clock: Arc<dyn Clock>) -> Self {
        Self { repo, queue, clock }
    }

    /// Persist a new stack in `CREATE_IN_PROGRESS` and schedule provisioning.
    ///
    /// The returned value and the queued job are separate copies.
    pub fn create_stack(
        &self,
        principal: &Principal,
        name: &str,
        template: &str,
        parameters: BTreeMap<String, String>,
    ) -> StackResult<Stack> {
        authenticated(principal)?;

        let mut stack = Stack::new(principal.user_id, name, template, parameters, self.clock.now());
        self.repo.save_stack(&stack)?;

        if let Err(e) = self.queue.submit(StackJob::Provision(stack.clone())) {
            // Never leave a stack in progress with no job behind it.
            stack.set_status(
                StackStatus::CreateFailed,
                format!("could not schedule provisioning: {e}"),
                self.clock.now(),
            );
            if let Err(save_err) = self.repo.save_stack(&stack) {
                warn!(stack_id = %stack.id, error = %save_err, "failed to mark unscheduled stack");
            }
            return Err(e);
        }

        info!(stack_id = %stack.id, name = %stack.name, owner = %principal, "stack created");
        Ok(stack)
    }

    pub fn get_stack(&self, principal: &Principal, id: Uuid) -> StackResult<Stack> {
        authenticated(principal)?;
        self.repo
            .get_stack(id)?
            .filter(|stack| principal.owns(stack.owner))
            .ok_or(StackError::NotFound(id))
    }

    /// The caller's stacks, newest first.
    pub fn list_stacks(&self, principal: &Principal) -> StackResult<Vec<Stack>> {
        authenticated(principal)?;
        Ok(self.repo.list_stacks_for_owner(principal.user_id)?)
    }

    /// Bookkeeping rows of one of the caller's stacks, in creation order.
    pub fn list_stack_resources(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> StackResult<Vec<StackResource>> {
        let stack = self.get_stack(principal, id)?;
        Ok(self.repo.list_resources(stack.id)?)
    }

    /// Schedule teardown of one of the caller's stacks. Returns before any
    /// resource is deleted.
    pub fn delete_stack(&self, principal: &Principal, id: Uuid) -> StackResult<()> {
        let stack = self.get_stack(principal, id)?;
        self.queue.submit(StackJob::Teardown(stack))?;
        info!(stack_id = %id, owner = %principal, "stack deletion scheduled");
        Ok(())
    }

    /// Dry-run parse of a template.
    pub fn validate_template(&self, template: &str) -> TemplateValidation {
        thecloud_template::validate(template)
    }
}

fn authenticated(principal: &Principal) -> StackResult<()> {
    if principal.is_anonymous() {
        return Err(StackError::Unauthorized);
    }
    Ok(())
}
