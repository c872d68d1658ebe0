//! Call journal and fault injection for the simulated backends.

use std::collections::HashMap;

use thecloud_core::{BackendError, EventRecord};
use uuid::Uuid;

/// Every collaborator operation the simulator implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    LaunchInstance,
    TerminateInstance,
    CreateVpc,
    DeleteVpc,
    CreateVolume,
    DeleteVolume,
    CreateSnapshot,
    DeleteSnapshot,
    AddTarget,
    RemoveTarget,
    RecordEvent,
    AverageCpu,
}

/// A collaborator call as the simulator received it.
///
/// Calls are journaled before fault injection runs, so failed attempts
/// show up too. Creation calls carry their inputs only.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    LaunchInstance {
        name: String,
        image: String,
        ports: String,
        vpc_id: Option<Uuid>,
    },
    TerminateInstance(Uuid),
    CreateVpc {
        name: String,
        cidr_block: Option<String>,
    },
    DeleteVpc(Uuid),
    CreateVolume {
        name: String,
        size_gb: u32,
    },
    DeleteVolume(Uuid),
    CreateSnapshot {
        volume_id: Uuid,
        name: String,
    },
    DeleteSnapshot(Uuid),
    AddTarget {
        lb_id: Uuid,
        instance_id: Uuid,
        port: u16,
        weight: u32,
    },
    RemoveTarget {
        lb_id: Uuid,
        instance_id: Uuid,
    },
    RecordEvent(EventRecord),
    AverageCpu {
        instances: Vec<Uuid>,
    },
}

impl SimCall {
    pub fn op(&self) -> SimOp {
        match self {
            SimCall::LaunchInstance { .. } => SimOp::LaunchInstance,
            SimCall::TerminateInstance(_) => SimOp::TerminateInstance,
            SimCall::CreateVpc { .. } => SimOp::CreateVpc,
            SimCall::DeleteVpc(_) => SimOp::DeleteVpc,
            SimCall::CreateVolume { .. } => SimOp::CreateVolume,
            SimCall::DeleteVolume(_) => SimOp::DeleteVolume,
            SimCall::CreateSnapshot { .. } => SimOp::CreateSnapshot,
            SimCall::DeleteSnapshot(_) => SimOp::DeleteSnapshot,
            SimCall::AddTarget { .. } => SimOp::AddTarget,
            SimCall::RemoveTarget { .. } => SimOp::RemoveTarget,
            SimCall::RecordEvent(_) => SimOp::RecordEvent,
            SimCall::AverageCpu { .. } => SimOp::AverageCpu,
        }
    }

    /// Whether the call mutates simulated infrastructure (as opposed to
    /// events and metric reads).
    pub fn is_mutation(&self) -> bool {
        !matches!(self, SimCall::RecordEvent(_) | SimCall::AverageCpu { .. })
    }
}

#[derive(Debug, Clone)]
struct Fault {
    /// Calls still allowed to succeed before the fault fires.
    remaining_ok: u32,
    error: BackendError,
}

/// Armed faults, keyed by operation.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    armed: HashMap<SimOp, Fault>,
}

impl Faults {
    pub(crate) fn arm(&mut self, op: SimOp, remaining_ok: u32, error: BackendError) {
        self.armed.insert(op, Fault { remaining_ok, error });
    }

    pub(crate) fn disarm(&mut self, op: SimOp) {
        self.armed.remove(&op);
    }

    /// Consume one call of `op`; returns the injected error if it fires.
    pub(crate) fn check(&mut self, op: SimOp) -> Result<(), BackendError> {
        match self.armed.get_mut(&op) {
            Some(fault) if fault.remaining_ok > 0 => {
                fault.remaining_ok -= 1;
                Ok(())
            }
            Some(fault) => Err(fault.error.clone()),
            None => Ok(()),
        }
    }
}
