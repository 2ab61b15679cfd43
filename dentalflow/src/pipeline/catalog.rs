//! Registry of immutable pipeline versions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::PipelineConfig;
use crate::core::PipelineRef;
use crate::errors::ConfigurationError;

/// Stores validated pipeline configs by `(name, version)`.
///
/// A registered version never changes. Publishing new steps means
/// registering a new version.
#[derive(Debug, Default)]
pub struct PipelineCatalog {
    configs: RwLock<HashMap<(String, String), Arc<PipelineConfig>>>,
}

impl PipelineCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates, normalizes and stores a config.
    ///
    /// Re-registering identical content is a no-op that returns the stored
    /// config.
    ///
    /// # Errors
    ///
    /// Returns the validation error, or a [`ConfigurationError`] if the
    /// version already exists with different content.
    pub fn register(&self, config: PipelineConfig) -> Result<Arc<PipelineConfig>, ConfigurationError> {
        let config = config.validated()?;
        let key = (config.name.clone(), config.version.clone());

        let mut configs = self.configs.write();
        if let Some(existing) = configs.get(&key) {
            if **existing == config {
                return Ok(Arc::clone(existing));
            }
            return Err(ConfigurationError::new(format!(
                "pipeline {}@{} is already registered with different content",
                key.0, key.1
            ))
            .with_field("version"));
        }

        let config = Arc::new(config);
        configs.insert(key, Arc::clone(&config));
        info!(pipeline = %config.name, version = %config.version, "Registered pipeline");
        Ok(config)
    }

    /// Looks up a version.
    #[must_use]
    pub fn get(&self, pipeline: &PipelineRef) -> Option<Arc<PipelineConfig>> {
        self.configs
            .read()
            .get(&(pipeline.name.clone(), pipeline.version.clone()))
            .cloned()
    }

    /// Returns the highest registered version of `name`.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<Arc<PipelineConfig>> {
        self.configs
            .read()
            .values()
            .filter(|config| config.name == name)
            .max_by_key(|config| version_tuple(&config.version))
            .cloned()
    }

    /// Registered versions of `name`, lowest first.
    #[must_use]
    pub fn versions(&self, name: &str) -> Vec<String> {
        let mut versions: Vec<String> = self
            .configs
            .read()
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect();
        versions.sort_by_key(|v| version_tuple(v));
        versions
    }
}

fn version_tuple(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
