//! Clinical resources synthesized from measurement groups

use serde::{Deserialize, Serialize};

use crate::measurements::GroupKey;

/// A resource ready for upsert into the clinical data store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalResource {
    /// Resource type tag, e.g. `Observation`
    pub resource_type: String,
    /// Deterministic identifier; re-converting a group yields the same value
    pub id: String,
    /// Key of the group this resource was built from
    pub source_key: GroupKey,
    /// Name of the conversion template that produced it
    pub template: String,
    /// Resource body in the destination format
    pub payload: serde_json::Value,
}

impl ClinicalResource {
    /// Identity used for upsert: resource type plus identifier
    pub fn upsert_key(&self) -> (String, String) {
        (self.resource_type.clone(), self.id.clone())
    }
}
