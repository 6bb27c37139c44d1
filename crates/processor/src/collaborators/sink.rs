//! In-memory resource sink

use super::ResourceSink;
use crate::error::EmissionResult;
use crate::telemetry::BatchTelemetry;
use async_trait::async_trait;
use dashmap::DashMap;
use iomt_types::ClinicalResource;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::trace;

/// Sink keeping resources by `(resource_type, id)`
///
/// Upserting an existing identifier replaces the stored resource, so the
/// number of stored resources only grows with distinct identifiers.
#[derive(Debug, Default)]
pub struct MemoryResourceSink {
    resources: DashMap<(String, String), ClinicalResource>,
    telemetry: RwLock<Vec<BatchTelemetry>>,
    upserts: AtomicU64,
}

impl MemoryResourceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<ClinicalResource> {
        self.resources
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Stored resources ordered by type and identifier
    pub fn resources(&self) -> Vec<ClinicalResource> {
        let mut resources: Vec<ClinicalResource> = self.resources.iter().map(|e| e.value().clone()).collect();
        resources.sort_by(|a, b| a.upsert_key().cmp(&b.upsert_key()));
        resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Upsert calls received, including overwrites
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    pub async fn telemetry(&self) -> Vec<BatchTelemetry> {
        self.telemetry.read().await.clone()
    }
}

#[async_trait]
impl ResourceSink for MemoryResourceSink {
    async fn upsert(&self, resource: &ClinicalResource) -> EmissionResult<()> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        let replaced = self.resources.insert(resource.upsert_key(), resource.clone()).is_some();
        trace!(resource_type = %resource.resource_type, id = %resource.id, replaced, "Resource upserted");
        Ok(())
    }

    async fn record_telemetry(&self, telemetry: &BatchTelemetry) -> EmissionResult<()> {
        self.telemetry.write().await.push(telemetry.clone());
        Ok(())
    }
}
