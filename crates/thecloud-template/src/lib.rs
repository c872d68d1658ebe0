//! thecloud-template: stack template parsing and reference resolution.
//!
//! A template is a YAML (or JSON) mapping with a top-level `Resources`
//! key. Each entry is keyed by its logical id and carries a `Type` and a
//! `Properties` mapping:
//!
//! ```yaml
//! Resources:
//!   net:
//!     Type: VPC
//!     Properties:
//!       CIDRBlock: 10.0.0.0/16
//!   web:
//!     Type: Instance
//!     Properties:
//!       Image: nginx:latest
//!       VpcID: { Ref: net }
//! ```
//!
//! Properties are validated into a typed variant per resource type at
//! parse time. Reference-capable properties hold a `RefOr`, which the
//! provisioner rewrites to a physical id once the referenced resource has
//! been created by an earlier pass (`ResourceType::PASS_ORDER`).

pub mod error;
pub mod reference;
pub mod resource;
pub mod template;

pub use error::{TemplateError, TemplateResult};
pub use reference::{PhysicalIds, RefOr, Reference};
pub use resource::{
    DEFAULT_INSTANCE_PORTS, DEFAULT_VOLUME_SIZE_GB, InstanceProperties, ResourceDefinition,
    SnapshotProperties, VolumeProperties, VpcProperties,
};
pub use template::{Template, TemplateValidation, validate};
