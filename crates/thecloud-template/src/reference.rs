//! Same-template references (`{Ref: <logicalID>}`) and their resolution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The single-key reference marker `{Ref: <logicalID>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    #[serde(rename = "Ref")]
    pub logical_id: String,
}

/// A property that holds either a literal value or a reference to another
/// resource in the same template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefOr<T> {
    Ref(Reference),
    Value(T),
}

impl RefOr<String> {
    /// Replace a reference with the physical id recorded for its logical id.
    ///
    /// References to logical ids not (yet) created are returned unchanged;
    /// the consumer reports them when it needs the value.
    pub fn resolve(&self, ids: &PhysicalIds) -> RefOr<String> {
        match self {
            RefOr::Ref(r) => match ids.get(&r.logical_id) {
                Some(physical) => RefOr::Value(physical.to_string()),
                None => self.clone(),
            },
            RefOr::Value(_) => self.clone(),
        }
    }
}

/// Logical id → physical id map accumulated across creation passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhysicalIds {
    ids: HashMap<String, String>,
}

impl PhysicalIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, logical_id: &str, physical_id: impl Into<String>) {
        self.ids.insert(logical_id.to_string(), physical_id.into());
    }

    pub fn get(&self, logical_id: &str) -> Option<&str> {
        self.ids.get(logical_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
