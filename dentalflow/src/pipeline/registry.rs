//! Dispatch table from (step kind, algorithm kind) to step functions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::{AlgorithmKind, PipelineConfig, StepKind, StepParams};
use crate::core::{Mesh, Outcome};
use crate::errors::ConfigurationError;

/// What a step function produces.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// The transformed mesh.
    pub mesh: Mesh,
    /// Algorithm-reported metrics such as `quality_score`.
    pub metrics: BTreeMap<String, f64>,
}

impl StepOutput {
    /// Wraps a mesh with no extra metrics.
    #[must_use]
    pub fn new(mesh: Mesh) -> Self {
        Self {
            mesh,
            metrics: BTreeMap::new(),
        }
    }

    /// Adds a metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// A geometry function: `(mesh, parameters) -> (mesh, metrics)`.
///
/// Runs on the blocking thread pool. Parameters are already normalized.
pub type StepFn = Arc<dyn Fn(&Mesh, &StepParams) -> Outcome<StepOutput> + Send + Sync>;

/// A registered step function and its declared properties.
#[derive(Clone)]
pub struct StepDefinition {
    /// The function.
    pub func: StepFn,
    /// Whether identical inputs always give identical output bytes.
    /// Only deterministic definitions are cache-eligible.
    pub deterministic: bool,
    /// Bumped when the implementation changes output; part of the cache key.
    pub version: u32,
}

impl StepDefinition {
    /// Wraps a function. Undeclared functions are treated as
    /// non-deterministic until [`StepDefinition::deterministic`] is called.
    #[must_use]
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Mesh, &StepParams) -> Outcome<StepOutput> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            deterministic: false,
            version: 1,
        }
    }

    /// Declares the function deterministic, making it cache-eligible.
    #[must_use]
    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    /// Sets the implementation version.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("deterministic", &self.deterministic)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Maps every (step kind, algorithm kind) pair to a [`StepDefinition`].
///
/// Owns no mutable state once built; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    definitions: HashMap<(StepKind, AlgorithmKind), StepDefinition>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition for an algorithm under its own step kind.
    ///
    /// # Errors
    ///
    /// Registering the same algorithm twice is a [`ConfigurationError`].
    pub fn register(
        &mut self,
        algorithm: AlgorithmKind,
        definition: StepDefinition,
    ) -> Result<(), ConfigurationError> {
        let key = (algorithm.step_kind(), algorithm);
        if self.definitions.contains_key(&key) {
            return Err(ConfigurationError::new(format!(
                "algorithm {algorithm} is already registered"
            ))
            .with_step(key.0.as_str()));
        }
        self.definitions.insert(key, definition);
        Ok(())
    }

    /// Builder-style [`StepRegistry::register`].
    ///
    /// # Errors
    ///
    /// See [`StepRegistry::register`].
    pub fn with(
        mut self,
        algorithm: AlgorithmKind,
        definition: StepDefinition,
    ) -> Result<Self, ConfigurationError> {
        self.register(algorithm, definition)?;
        Ok(self)
    }

    /// Looks up a definition.
    #[must_use]
    pub fn get(&self, step: StepKind, algorithm: AlgorithmKind) -> Option<&StepDefinition> {
        self.definitions.get(&(step, algorithm))
    }

    /// Number of registered pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Pairs with no registered definition, in canonical order.
    #[must_use]
    pub fn missing(&self) -> Vec<(StepKind, AlgorithmKind)> {
        StepKind::ALL
            .into_iter()
            .flat_map(|step| step.algorithms().iter().map(move |algo| (step, *algo)))
            .filter(|key| !self.definitions.contains_key(key))
            .collect()
    }

    /// Startup check that every pair is registered.
    ///
    /// # Errors
    ///
    /// Lists the missing pairs.
    pub fn ensure_complete(&self) -> Result<(), ConfigurationError> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = missing
            .iter()
            .map(|(step, algo)| format!("{step}/{algo}"))
            .collect();
        Err(ConfigurationError::new(format!(
            "unregistered algorithms: {}",
            names.join(", ")
        )))
    }

    /// Checks that every enabled step of `config` can be dispatched.
    ///
    /// # Errors
    ///
    /// Names the first enabled step without a definition.
    pub fn check_config(&self, config: &PipelineConfig) -> Result<(), ConfigurationError> {
        for step in config.enabled_steps() {
            if self.get(step.step_kind, step.algorithm_kind).is_none() {
                return Err(ConfigurationError::new(format!(
                    "no implementation registered for {}",
                    step.algorithm_kind
                ))
                .with_step(step.step_kind.as_str())
                .with_field("algorithm_kind"));
            }
        }
        Ok(())
    }
}
