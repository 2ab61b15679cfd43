//! Pipeline configuration, step dispatch and execution.
//!
//! This module provides:
//! - Step and algorithm kinds with their parameter schemas
//! - Validated, versioned pipeline configurations and a catalog of them
//! - The step registry mapping (step, algorithm) to an implementation
//! - Cache key derivation
//! - The sequential, cache-aware pipeline executor

mod cache_key;
mod catalog;
mod executor;
mod params;
mod registry;
mod spec;

pub use cache_key::{CacheKeyInput, ENGINE_VERSION};
pub use catalog::PipelineCatalog;
pub use executor::{NoopObserver, PipelineExecutor, PipelineRun, StepObserver};
pub use params::{Bound, ParamSpec, ParamType, ParamValue, StepParams};
pub use registry::{StepDefinition, StepFn, StepOutput, StepRegistry};
pub use spec::{AlgorithmKind, PipelineConfig, PipelineStepConfig, StepKind, DEFAULT_CACHE_TTL};
