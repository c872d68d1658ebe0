//! Typed resource definitions.

use serde::{Deserialize, Serialize};
use thecloud_core::ResourceType;

use crate::reference::{PhysicalIds, RefOr};

/// Volume size used when a template omits `Size`.
pub const DEFAULT_VOLUME_SIZE_GB: u32 = 10;

/// Port spec used when an instance omits `Ports`.
pub const DEFAULT_INSTANCE_PORTS: &str = "80";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcProperties {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "CIDRBlock", default)]
    pub cidr_block: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeProperties {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Size", default)]
    pub size: Option<u32>,
}

impl VolumeProperties {
    pub fn size_gb(&self) -> u32 {
        match self.size {
            Some(0) | None => DEFAULT_VOLUME_SIZE_GB,
            Some(size) => size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProperties {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Ports", default)]
    pub ports: Option<String>,
    #[serde(rename = "VpcID", default)]
    pub vpc_id: Option<RefOr<String>>,
}

impl InstanceProperties {
    pub fn ports(&self) -> &str {
        self.ports
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_INSTANCE_PORTS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotProperties {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "VolumeID")]
    pub volume_id: RefOr<String>,
}

/// One parsed template resource, its properties typed by resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceDefinition {
    Vpc(VpcProperties),
    Volume(VolumeProperties),
    Instance(InstanceProperties),
    Snapshot(SnapshotProperties),
}

impl ResourceDefinition {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceDefinition::Vpc(_) => ResourceType::Vpc,
            ResourceDefinition::Volume(_) => ResourceType::Volume,
            ResourceDefinition::Instance(_) => ResourceType::Instance,
            ResourceDefinition::Snapshot(_) => ResourceType::Snapshot,
        }
    }

    /// Explicit `Name` property, if set and non-empty.
    pub fn name(&self) -> Option<&str> {
        let name = match self {
            ResourceDefinition::Vpc(p) => &p.name,
            ResourceDefinition::Volume(p) => &p.name,
            ResourceDefinition::Instance(p) => &p.name,
            ResourceDefinition::Snapshot(p) => &p.name,
        };
        name.as_deref().filter(|n| !n.is_empty())
    }

    /// Copy of this definition with every resolvable reference rewritten
    /// to its physical id.
    pub fn resolve_refs(&self, ids: &PhysicalIds) -> ResourceDefinition {
        match self {
            ResourceDefinition::Instance(p) => ResourceDefinition::Instance(InstanceProperties {
                vpc_id: p.vpc_id.as_ref().map(|v| v.resolve(ids)),
                ..p.clone()
            }),
            ResourceDefinition::Snapshot(p) => ResourceDefinition::Snapshot(SnapshotProperties {
                volume_id: p.volume_id.resolve(ids),
                ..p.clone()
            }),
            ResourceDefinition::Vpc(_) | ResourceDefinition::Volume(_) => self.clone(),
        }
    }
}
