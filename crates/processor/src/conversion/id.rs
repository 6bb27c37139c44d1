//! Deterministic resource identifiers

use chrono::{DateTime, Utc};
use iomt_types::GroupKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a synthesized resource
///
/// Resource IDs must be:
/// - Stable: the same group and window always produce the same ID
/// - Distinct: different keys or windows produce different IDs
/// - Random-free: reprocessing upserts instead of duplicating
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Hash the group key and window start
    ///
    /// `discriminator` separates several resources built from one group;
    /// the first resource of a group passes `None`.
    pub fn for_group(key: &GroupKey, window_start: DateTime<Utc>, discriminator: Option<&str>) -> Self {
        let mut hasher = Sha256::new();

        for part in [
            Some(key.measure_type.as_str()),
            Some(key.device_id.as_str()),
            key.patient_id.as_deref(),
            key.encounter_id.as_deref(),
            key.correlation_id.as_deref(),
        ] {
            update_optional(&mut hasher, part);
        }
        hasher.update(window_start.timestamp_millis().to_be_bytes());

        if let Some(discriminator) = discriminator {
            update_optional(&mut hasher, Some(discriminator));
        }

        Self::from_bytes(&hasher.finalize())
    }

    /// Create an ID from bytes (hex-encoded)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length-prefixed so that `("ab", "c")` and `("a", "bc")` differ, with a
/// presence byte so that `None` and `Some("")` differ
fn update_optional(hasher: &mut Sha256, part: Option<&str>) {
    match part {
        None => hasher.update([0u8]),
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
    }
}
