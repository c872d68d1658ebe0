//! Values exchanged with backend collaborators.
//!
//! These mirror what the compute, network and storage services hand back
//! after creating a physical resource. The engines only ever keep the
//! identifier; the remaining fields exist for logging and the simulator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Resource types ────────────────────────────────────────────────

/// Kind of physical resource a stack can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "VPC")]
    Vpc,
    Volume,
    Instance,
    Snapshot,
}

impl ResourceType {
    /// Creation order used by the stack provisioner. Rollback walks the
    /// recorded resources backwards, so this order also fixes teardown.
    pub const PASS_ORDER: [ResourceType; 4] = [
        ResourceType::Vpc,
        ResourceType::Volume,
        ResourceType::Instance,
        ResourceType::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Vpc => "VPC",
            ResourceType::Volume => "Volume",
            ResourceType::Instance => "Instance",
            ResourceType::Snapshot => "Snapshot",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VPC" => Ok(ResourceType::Vpc),
            "Volume" => Ok(ResourceType::Volume),
            "Instance" => Ok(ResourceType::Instance),
            "Snapshot" => Ok(ResourceType::Snapshot),
            other => Err(format!("unsupported resource type {other:?}")),
        }
    }
}

// ── Compute ───────────────────────────────────────────────────────

/// A volume to attach at launch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: Uuid,
    pub mount_path: String,
}

/// Everything the compute backend needs to start an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// Port mapping, `"<host>:<container>"` or just `"<container>"`.
    /// Host port `0` asks the backend to auto-assign.
    pub ports: String,
    pub vpc_id: Option<Uuid>,
    pub volumes: Vec<VolumeAttachment>,
}

/// A launched compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub ports: String,
    pub vpc_id: Option<Uuid>,
}

// ── Network ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    pub id: Uuid,
    pub name: String,
    pub cidr_block: String,
}

// ── Storage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: Uuid,
    pub name: String,
    pub size_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub volume_id: Uuid,
    pub name: String,
}

// ── Events ────────────────────────────────────────────────────────

/// An audit/observability event handed to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event type, e.g. `SCALE_OUT`.
    pub event_type: String,
    pub resource_id: String,
    pub resource_type: String,
    pub metadata: serde_json::Value,
}

/// Extract the container port from a port spec (`"80"`, `"8080:80"`).
pub fn container_port(spec: &str) -> Option<u16> {
    let container = spec.trim().rsplit(':').next()?;
    container.trim().parse::<u16>().ok().filter(|p| *p != 0)
}
