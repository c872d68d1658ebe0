//! Template parsing and validation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thecloud_core::ResourceType;

use crate::error::{TemplateError, TemplateResult};
use crate::resource::ResourceDefinition;

#[derive(Deserialize)]
struct RawTemplate {
    #[serde(rename = "Resources", default)]
    resources: Option<Mapping>,
}

#[derive(Deserialize)]
struct RawResource {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Properties", default)]
    properties: Option<Value>,
}

/// A parsed template: resources in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    resources: Vec<(String, ResourceDefinition)>,
}

impl Template {
    /// Parse template text, failing on the first structural or resource error.
    pub fn parse(text: &str) -> TemplateResult<Self> {
        let (resources, mut errors) = parse_entries(text)?;
        if !errors.is_empty() {
            return Err(errors.remove(0));
        }
        Ok(Self { resources })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// All resources in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResourceDefinition)> {
        self.resources.iter().map(|(id, def)| (id.as_str(), def))
    }

    /// The resources created by one pass, in declaration order.
    pub fn pass(&self, kind: ResourceType) -> impl Iterator<Item = (&str, &ResourceDefinition)> {
        self.iter().filter(move |(_, def)| def.resource_type() == kind)
    }

    /// Every resource in the order the provisioner creates them.
    pub fn creation_order(&self) -> impl Iterator<Item = (&str, &ResourceDefinition)> {
        ResourceType::PASS_ORDER
            .into_iter()
            .flat_map(move |kind| self.pass(kind))
    }
}

/// Result of a dry-run validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Check a template without creating anything, reporting every problem found.
pub fn validate(text: &str) -> TemplateValidation {
    let errors = match parse_entries(text) {
        Ok((_, errors)) => errors,
        Err(e) => vec![e],
    };
    TemplateValidation {
        valid: errors.is_empty(),
        errors: errors.iter().map(ToString::to_string).collect(),
    }
}

/// Parse the document structure. Structural failures abort; per-resource
/// failures are collected so validation can report all of them.
fn parse_entries(
    text: &str,
) -> TemplateResult<(Vec<(String, ResourceDefinition)>, Vec<TemplateError>)> {
    let raw: RawTemplate =
        serde_yaml::from_str(text).map_err(|e| TemplateError::Syntax(e.to_string()))?;
    let entries = raw.resources.unwrap_or_default();
    if entries.is_empty() {
        return Err(TemplateError::NoResources);
    }

    let mut resources = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for (key, value) in entries {
        let logical_id = match key {
            Value::String(s) if !s.trim().is_empty() => s,
            _ => {
                errors.push(TemplateError::InvalidLogicalId);
                continue;
            }
        };
        match parse_resource(&logical_id, value) {
            Ok(def) => resources.push((logical_id, def)),
            Err(e) => errors.push(e),
        }
    }
    Ok((resources, errors))
}

fn parse_resource(logical_id: &str, value: Value) -> TemplateResult<ResourceDefinition> {
    let raw: RawResource =
        serde_yaml::from_value(value).map_err(|e| TemplateError::InvalidResource {
            logical_id: logical_id.to_string(),
            message: e.to_string(),
        })?;
    let kind: ResourceType =
        raw.kind
            .parse()
            .map_err(|_| TemplateError::UnsupportedType {
                logical_id: logical_id.to_string(),
                kind: raw.kind.clone(),
            })?;
    let props = match raw.properties {
        None | Some(Value::Null) => Value::Mapping(Mapping::new()),
        Some(v) => v,
    };

    Ok(match kind {
        ResourceType::Vpc => ResourceDefinition::Vpc(properties(logical_id, kind, props)?),
        ResourceType::Volume => ResourceDefinition::Volume(properties(logical_id, kind, props)?),
        ResourceType::Instance => {
            ResourceDefinition::Instance(properties(logical_id, kind, props)?)
        }
        ResourceType::Snapshot => {
            ResourceDefinition::Snapshot(properties(logical_id, kind, props)?)
        }
    })
}

fn properties<T: DeserializeOwned>(
    logical_id: &str,
    resource_type: ResourceType,
    props: Value,
) -> TemplateResult<T> {
    serde_yaml::from_value(props).map_err(|e| TemplateError::InvalidProperties {
        logical_id: logical_id.to_string(),
        resource_type,
        message: e.to_string(),
    })
}
