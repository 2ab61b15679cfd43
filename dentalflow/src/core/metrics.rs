//! Per-step execution metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::pipeline::{AlgorithmKind, StepKind};

/// How the cache participated in a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Output was loaded from the cache.
    Hit,
    /// Output was computed (and stored if the write succeeded).
    Miss,
    /// Caching was disabled for the step.
    Bypassed,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::Miss => write!(f, "miss"),
            Self::Bypassed => write!(f, "bypassed"),
        }
    }
}

/// Metrics recorded for one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// The step.
    pub step_kind: StepKind,
    /// The algorithm it ran.
    pub algorithm_kind: AlgorithmKind,
    /// Vertices before the step.
    pub input_vertices: usize,
    /// Vertices after the step.
    pub output_vertices: usize,
    /// Faces before the step.
    pub input_faces: usize,
    /// Faces after the step.
    pub output_faces: usize,
    /// Wall-clock compute time. Zero on a cache hit.
    pub duration_ms: f64,
    /// `1 - output/input` for vertices.
    pub vertex_reduction_ratio: f64,
    /// `1 - output/input` for faces.
    pub face_reduction_ratio: f64,
    /// Cache participation.
    pub cache: CacheOutcome,
    /// The key used for cache lookups, if the step was cache-eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Metrics reported by the algorithm itself.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl StepMetrics {
    /// Builds metrics from before/after counts.
    #[must_use]
    pub fn new(
        step_kind: StepKind,
        algorithm_kind: AlgorithmKind,
        (input_vertices, input_faces): (usize, usize),
        (output_vertices, output_faces): (usize, usize),
    ) -> Self {
        Self {
            step_kind,
            algorithm_kind,
            input_vertices,
            output_vertices,
            input_faces,
            output_faces,
            duration_ms: 0.0,
            vertex_reduction_ratio: reduction_ratio(input_vertices, output_vertices),
            face_reduction_ratio: reduction_ratio(input_faces, output_faces),
            cache: CacheOutcome::Bypassed,
            cache_key: None,
            extra: BTreeMap::new(),
        }
    }

    /// Sets the compute duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Sets the cache outcome and key.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheOutcome, key: Option<String>) -> Self {
        self.cache = cache;
        self.cache_key = key;
        self
    }

    /// Sets the algorithm-reported metrics.
    #[must_use]
    pub fn with_extra(mut self, extra: BTreeMap<String, f64>) -> Self {
        self.extra = extra;
        self
    }
}

#[allow(clippy::cast_precision_loss)]
fn reduction_ratio(input: usize, output: usize) -> f64 {
    if input == 0 {
        0.0
    } else {
        1.0 - output as f64 / input as f64
    }
}
