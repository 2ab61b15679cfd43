//! Pipeline and step configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use super::params::StepParams;
use crate::errors::ConfigurationError;

const SEMVER_PATTERN: &str = r"^\d+\.\d+\.\d+$";

/// Default TTL for cached step outputs.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The fixed set of pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Noise removal.
    Denoise,
    /// Vertex reduction.
    Decimate,
    /// Surface reconstruction over holes.
    HoleFill,
    /// Registration against a reference.
    Alignment,
    /// Region-of-interest cropping.
    RoiCrop,
    /// Dental arch segmentation.
    ArchIsolation,
}

impl StepKind {
    /// Every step kind, in canonical order.
    pub const ALL: [Self; 6] = [
        Self::Denoise,
        Self::Decimate,
        Self::HoleFill,
        Self::Alignment,
        Self::RoiCrop,
        Self::ArchIsolation,
    ];

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Denoise => "denoise",
            Self::Decimate => "decimate",
            Self::HoleFill => "hole_fill",
            Self::Alignment => "alignment",
            Self::RoiCrop => "roi_crop",
            Self::ArchIsolation => "arch_isolation",
        }
    }

    /// Algorithms valid for this step.
    #[must_use]
    pub fn algorithms(&self) -> &'static [AlgorithmKind] {
        use AlgorithmKind as A;
        match self {
            Self::Denoise => &[A::BilateralFilter, A::GaussianFilter, A::StatisticalOutlierRemoval],
            Self::Decimate => &[A::VoxelDownSample, A::UniformDownSample],
            Self::HoleFill => &[A::PoissonReconstruction, A::BallPivoting, A::AlphaShape],
            Self::Alignment => &[A::IcpAlignment, A::LandmarkAlignment, A::FeatureBasedAlignment],
            Self::RoiCrop => &[A::BoundingBoxCrop, A::SphericalCrop, A::PlanarCrop],
            Self::ArchIsolation => &[
                A::CurvatureBasedSegmentation,
                A::ClusteringSegmentation,
                A::MachineLearningSegmentation,
            ],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of algorithms. Each belongs to exactly one [`StepKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// Edge-preserving smoothing.
    BilateralFilter,
    /// Gaussian smoothing.
    GaussianFilter,
    /// Drops points far from their neighbors.
    StatisticalOutlierRemoval,
    /// Grid-based downsampling.
    VoxelDownSample,
    /// Keeps every n-th vertex.
    UniformDownSample,
    /// Poisson surface reconstruction.
    PoissonReconstruction,
    /// Ball-pivoting reconstruction.
    BallPivoting,
    /// Alpha-shape reconstruction.
    AlphaShape,
    /// Iterative closest point.
    IcpAlignment,
    /// Landmark correspondence.
    LandmarkAlignment,
    /// Feature matching.
    FeatureBasedAlignment,
    /// Axis-aligned box crop.
    BoundingBoxCrop,
    /// Sphere crop.
    SphericalCrop,
    /// Half-space crop.
    PlanarCrop,
    /// Curvature thresholding.
    CurvatureBasedSegmentation,
    /// Point clustering.
    ClusteringSegmentation,
    /// Model-driven segmentation.
    MachineLearningSegmentation,
}

impl AlgorithmKind {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BilateralFilter => "bilateral_filter",
            Self::GaussianFilter => "gaussian_filter",
            Self::StatisticalOutlierRemoval => "statistical_outlier_removal",
            Self::VoxelDownSample => "voxel_down_sample",
            Self::UniformDownSample => "uniform_down_sample",
            Self::PoissonReconstruction => "poisson_reconstruction",
            Self::BallPivoting => "ball_pivoting",
            Self::AlphaShape => "alpha_shape",
            Self::IcpAlignment => "icp_alignment",
            Self::LandmarkAlignment => "landmark_alignment",
            Self::FeatureBasedAlignment => "feature_based_alignment",
            Self::BoundingBoxCrop => "bounding_box_crop",
            Self::SphericalCrop => "spherical_crop",
            Self::PlanarCrop => "planar_crop",
            Self::CurvatureBasedSegmentation => "curvature_based_segmentation",
            Self::ClusteringSegmentation => "clustering_segmentation",
            Self::MachineLearningSegmentation => "machine_learning_segmentation",
        }
    }

    /// The step kind this algorithm belongs to.
    #[must_use]
    pub fn step_kind(&self) -> StepKind {
        match self {
            Self::BilateralFilter | Self::GaussianFilter | Self::StatisticalOutlierRemoval => {
                StepKind::Denoise
            }
            Self::VoxelDownSample | Self::UniformDownSample => StepKind::Decimate,
            Self::PoissonReconstruction | Self::BallPivoting | Self::AlphaShape => {
                StepKind::HoleFill
            }
            Self::IcpAlignment | Self::LandmarkAlignment | Self::FeatureBasedAlignment => {
                StepKind::Alignment
            }
            Self::BoundingBoxCrop | Self::SphericalCrop | Self::PlanarCrop => StepKind::RoiCrop,
            Self::CurvatureBasedSegmentation
            | Self::ClusteringSegmentation
            | Self::MachineLearningSegmentation => StepKind::ArchIsolation,
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepConfig {
    /// Which step.
    pub step_kind: StepKind,
    /// Which algorithm. Must belong to `step_kind`.
    pub algorithm_kind: AlgorithmKind,
    /// Disabled steps are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Algorithm parameters, validated against the algorithm's schema.
    #[serde(default)]
    pub parameters: StepParams,
    /// Step-level cache switch. Both this and the pipeline switch must be on.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl PipelineStepConfig {
    /// Creates an enabled, cacheable step with no explicit parameters.
    #[must_use]
    pub fn new(step_kind: StepKind, algorithm_kind: AlgorithmKind) -> Self {
        Self {
            step_kind,
            algorithm_kind,
            enabled: true,
            parameters: StepParams::new(),
            cache_enabled: true,
        }
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<super::ParamValue>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    /// Enables or disables the step.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the step-level cache switch.
    #[must_use]
    pub fn with_cache_enabled(mut self, cache_enabled: bool) -> Self {
        self.cache_enabled = cache_enabled;
        self
    }

    /// Checks the algorithm against the step kind and normalizes parameters.
    pub fn normalized(&self) -> Result<Self, ConfigurationError> {
        if self.algorithm_kind.step_kind() != self.step_kind {
            return Err(ConfigurationError::new(format!(
                "algorithm {} is not valid for step {}",
                self.algorithm_kind, self.step_kind
            ))
            .with_step(self.step_kind.as_str())
            .with_field("algorithm_kind"));
        }
        let parameters = self
            .parameters
            .normalize(self.algorithm_kind)
            .map_err(|err| err.with_step(self.step_kind.as_str()))?;
        Ok(Self {
            parameters,
            ..self.clone()
        })
    }
}

/// An ordered, versioned pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// `MAJOR.MINOR.PATCH`.
    #[serde(default = "default_version")]
    pub version: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Steps in execution order.
    pub steps: Vec<PipelineStepConfig>,
    /// Pipeline-level cache switch.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// TTL for entries written by this pipeline, serialized as seconds.
    #[serde(default = "default_cache_ttl", with = "duration_secs")]
    pub cache_ttl: Duration,
}

impl PipelineConfig {
    /// Creates an empty pipeline at version 1.0.0.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            steps: Vec::new(),
            cache_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// The stock dental pipeline: outlier removal then voxel downsampling.
    #[must_use]
    pub fn default_dental() -> Self {
        Self::new("default_dental")
            .with_description("Statistical outlier removal followed by voxel downsampling")
            .with_step(
                PipelineStepConfig::new(StepKind::Denoise, AlgorithmKind::StatisticalOutlierRemoval)
                    .with_param("nb_neighbors", 20_i64)
                    .with_param("std_ratio", 2.0),
            )
            .with_step(
                PipelineStepConfig::new(StepKind::Decimate, AlgorithmKind::VoxelDownSample)
                    .with_param("voxel_size", 0.05),
            )
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: PipelineStepConfig) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the pipeline-level cache switch.
    #[must_use]
    pub fn with_cache_enabled(mut self, cache_enabled: bool) -> Self {
        self.cache_enabled = cache_enabled;
        self
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Enabled steps in execution order.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &PipelineStepConfig> {
        self.steps.iter().filter(|step| step.enabled)
    }

    /// Validates the pipeline and returns a copy with normalized parameters.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an empty name, a malformed
    /// version, no steps, a repeated step kind, a mismatched algorithm, or
    /// parameters that fail their schema.
    pub fn validated(&self) -> Result<Self, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::new("pipeline name must not be empty").with_field("name"));
        }
        if !is_semver(&self.version) {
            return Err(ConfigurationError::new(format!(
                "version '{}' is not MAJOR.MINOR.PATCH",
                self.version
            ))
            .with_field("version"));
        }
        if self.steps.is_empty() {
            return Err(ConfigurationError::new("pipeline must have at least one step").with_field("steps"));
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigurationError::new("cache_ttl must be positive").with_field("cache_ttl"));
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(step.step_kind) {
                return Err(ConfigurationError::new("step kind appears more than once")
                    .with_step(step.step_kind.as_str()));
            }
            steps.push(step.normalized()?);
        }

        Ok(Self {
            steps,
            ..self.clone()
        })
    }
}

fn is_semver(version: &str) -> bool {
    Regex::new(SEMVER_PATTERN)
        .map(|re| re.is_match(version))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ParamValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_every_algorithm_has_one_step_kind() {
        let mut count = 0;
        for step in StepKind::ALL {
            for algo in step.algorithms() {
                assert_eq!(algo.step_kind(), step);
                count += 1;
            }
        }
        assert_eq!(count, 17);
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&StepKind::HoleFill).unwrap(), r#""hole_fill""#);
        assert_eq!(
            serde_json::to_string(&AlgorithmKind::IcpAlignment).unwrap(),
            r#""icp_alignment""#
        );
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let config: PipelineConfig = serde_json::from_value(json!({
            "name": "scan",
            "steps": [{"step_kind": "denoise", "algorithm_kind": "gaussian_filter"}]
        }))
        .unwrap();
        assert_eq!(config.version, "1.0.0");
        assert_eq!(config.description, "");
        assert!(config.cache_enabled);
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert!(config.steps[0].enabled);
        assert!(config.steps[0].cache_enabled);
    }

    #[test]
    fn test_default_dental_is_valid() {
        let config = PipelineConfig::default_dental().validated().unwrap();
        assert_eq!(config.steps.len(), 2);
        assert_eq!(
            config.steps[1].parameters.get("voxel_size"),
            Some(&ParamValue::Float(0.05))
        );
    }

    #[test]
    fn test_validation_failures() {
        let step = PipelineStepConfig::new(StepKind::Denoise, AlgorithmKind::GaussianFilter);

        let err = PipelineConfig::new("").with_step(step.clone()).validated().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("name"));

        let err = PipelineConfig::new("p")
            .with_version("1.0")
            .with_step(step.clone())
            .validated()
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("version"));

        let err = PipelineConfig::new("p").validated().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("steps"));

        let err = PipelineConfig::new("p")
            .with_step(step.clone())
            .with_step(step)
            .validated()
            .unwrap_err();
        assert_eq!(err.step.as_deref(), Some("denoise"));
    }

    #[test]
    fn test_mismatched_algorithm_rejected() {
        let err = PipelineConfig::new("p")
            .with_step(PipelineStepConfig::new(StepKind::Decimate, AlgorithmKind::BallPivoting))
            .validated()
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("algorithm_kind"));
    }

    #[test]
    fn test_unknown_parameter_rejected_at_configuration_time() {
        let err = PipelineConfig::new("p")
            .with_step(
                PipelineStepConfig::new(StepKind::Decimate, AlgorithmKind::VoxelDownSample)
                    .with_param("voxel_sz", 0.1),
            )
            .validated()
            .unwrap_err();
        assert_eq!(err.step.as_deref(), Some("decimate"));
        assert_eq!(err.field.as_deref(), Some("voxel_sz"));
    }
}
