//! Template stores

use super::TemplateStore;
use crate::conversion::ConversionTemplateCollection;
use crate::error::{CollaboratorError, CollaboratorResult, ProcessorError};
use crate::template::{TemplateCollection, TemplateRegistry, TemplateSource};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Templates held in memory by `(name, version)`
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    templates: DashMap<(String, String), String>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, version: impl Into<String>, text: impl Into<String>) {
        self.templates.insert((name.into(), version.into()), text.into());
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn fetch(&self, name: &str, version: &str) -> CollaboratorResult<String> {
        self.templates
            .get(&(name.to_string(), version.to_string()))
            .map(|text| text.value().clone())
            .ok_or_else(|| CollaboratorError::TemplateStore {
                name: name.to_string(),
                version: version.to_string(),
                reason: "not found".to_string(),
            })
    }
}

/// Templates read from `<root>/<name>/<version>.json`
#[derive(Debug, Clone)]
pub struct DirectoryTemplateStore {
    root: PathBuf,
}

impl DirectoryTemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str, version: &str) -> CollaboratorResult<PathBuf> {
        let unsafe_part = |part: &str| part.is_empty() || part.contains(['/', '\\']) || part == "..";
        if unsafe_part(name) || unsafe_part(version) {
            return Err(CollaboratorError::TemplateStore {
                name: name.to_string(),
                version: version.to_string(),
                reason: "invalid template name or version".to_string(),
            });
        }
        Ok(self.root.join(name).join(format!("{}.json", version)))
    }
}

#[async_trait]
impl TemplateStore for DirectoryTemplateStore {
    async fn fetch(&self, name: &str, version: &str) -> CollaboratorResult<String> {
        let path = self.path_of(name, version)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CollaboratorError::TemplateStore {
                name: name.to_string(),
                version: version.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })
    }
}

/// Fetch and parse both template sets the pipeline runs with
///
/// Parse failures surface here, before any event is processed.
pub async fn load_templates(
    store: &dyn TemplateStore,
    registry: &TemplateRegistry,
    device: &TemplateSource,
    fhir: &TemplateSource,
) -> Result<(TemplateCollection, ConversionTemplateCollection), ProcessorError> {
    let device_text = store.fetch(&device.name, &device.version).await?;
    let device_templates = registry.load(device.clone(), &device_text)?;

    let fhir_text = store.fetch(&fhir.name, &fhir.version).await?;
    let conversion_templates = ConversionTemplateCollection::load(fhir.clone(), &fhir_text)?;

    info!(
        device_templates = %device,
        device_template_count = device_templates.len(),
        conversion_templates = %fhir,
        conversion_template_count = conversion_templates.len(),
        "Templates loaded"
    );

    Ok((device_templates, conversion_templates))
}
