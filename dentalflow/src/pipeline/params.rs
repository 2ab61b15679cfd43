//! Step parameters, per-algorithm schemas, and normalization.
//!
//! Normalization is what makes cache keys stable: defaults are filled in,
//! integers given for float parameters are widened, and `-0.0` becomes
//! `0.0`, so `{}` and a spelled-out default map to the same key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::AlgorithmKind;
use crate::errors::ConfigurationError;

/// A scalar parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Free text.
    Text(String),
}

impl ParamValue {
    /// Returns the value as a float, widening integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the value as an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a bool.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Canonical, type-tagged encoding used in cache keys.
    ///
    /// Floats use the shortest round-trip representation so equal values
    /// always encode identically.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Bool(v) => format!("b:{v}"),
            Self::Int(v) => format!("i:{v}"),
            Self::Float(v) => format!("f:{v:?}"),
            Self::Text(v) => format!("s:{}", serde_json::Value::String(v.clone())),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Float. Integers are accepted and widened.
    Float,
    /// Text.
    Text,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// Lower bound on a numeric parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    /// Strictly greater than zero.
    Positive,
    /// Greater than or equal to the value.
    AtLeast(f64),
}

impl Bound {
    fn admits(self, value: f64) -> bool {
        match self {
            Self::Positive => value > 0.0,
            Self::AtLeast(min) => value >= min,
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "> 0"),
            Self::AtLeast(min) => write!(f, ">= {min}"),
        }
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: &'static str,
    /// Declared type.
    pub ty: ParamType,
    /// Value used when the parameter is omitted.
    pub default: Option<ParamValue>,
    /// Whether the parameter must be supplied.
    pub required: bool,
    /// Optional lower bound for numeric parameters.
    pub bound: Option<Bound>,
}

impl ParamSpec {
    fn float(name: &'static str, default: f64) -> Self {
        Self {
            name,
            ty: ParamType::Float,
            default: Some(ParamValue::Float(default)),
            required: false,
            bound: None,
        }
    }

    fn int(name: &'static str, default: i64) -> Self {
        Self {
            name,
            ty: ParamType::Int,
            default: Some(ParamValue::Int(default)),
            required: false,
            bound: None,
        }
    }

    fn optional(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            default: None,
            required: false,
            bound: None,
        }
    }

    fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            required: true,
            ..Self::optional(name, ty)
        }
    }

    fn positive(mut self) -> Self {
        self.bound = Some(Bound::Positive);
        self
    }

    fn at_least(mut self, min: f64) -> Self {
        self.bound = Some(Bound::AtLeast(min));
        self
    }

    fn check(&self, value: &ParamValue) -> Result<ParamValue, ConfigurationError> {
        let mismatch = || {
            ConfigurationError::new(format!(
                "expected {} but got {}",
                self.ty,
                value.type_name()
            ))
            .with_field(self.name)
        };

        let checked = match (self.ty, value) {
            (ParamType::Bool, ParamValue::Bool(_))
            | (ParamType::Int, ParamValue::Int(_))
            | (ParamType::Text, ParamValue::Text(_)) => value.clone(),
            (ParamType::Float, ParamValue::Float(_) | ParamValue::Int(_)) => {
                let v = value.as_f64().ok_or_else(mismatch)?;
                if !v.is_finite() {
                    return Err(ConfigurationError::new("value must be finite").with_field(self.name));
                }
                ParamValue::Float(if v == 0.0 { 0.0 } else { v })
            }
            _ => return Err(mismatch()),
        };

        if let (Some(bound), Some(v)) = (self.bound, checked.as_f64()) {
            if !bound.admits(v) {
                return Err(ConfigurationError::new(format!("value {v} must be {bound}"))
                    .with_field(self.name));
            }
        }
        Ok(checked)
    }
}

impl AlgorithmKind {
    /// Declared parameters for this algorithm.
    #[must_use]
    pub fn parameter_schema(&self) -> Vec<ParamSpec> {
        match self {
            Self::BilateralFilter => vec![
                ParamSpec::float("sigma_s", 1.0).positive(),
                ParamSpec::float("sigma_r", 0.1).positive(),
                ParamSpec::int("iterations", 1).at_least(1.0),
            ],
            Self::GaussianFilter => vec![
                ParamSpec::float("sigma", 1.0).positive(),
                ParamSpec::int("iterations", 1).at_least(1.0),
            ],
            Self::StatisticalOutlierRemoval => vec![
                ParamSpec::int("nb_neighbors", 20).at_least(1.0),
                ParamSpec::float("std_ratio", 2.0).positive(),
            ],
            Self::VoxelDownSample | Self::FeatureBasedAlignment => {
                vec![ParamSpec::float("voxel_size", 0.05).positive()]
            }
            Self::UniformDownSample => {
                vec![ParamSpec::optional("target_vertices", ParamType::Int).at_least(1.0)]
            }
            Self::PoissonReconstruction => vec![ParamSpec::int("depth", 8).at_least(1.0)],
            Self::BallPivoting => vec![ParamSpec::float("radius", 0.05).positive()],
            Self::AlphaShape => vec![ParamSpec::float("alpha", 0.03).positive()],
            Self::IcpAlignment => vec![
                ParamSpec::int("max_iterations", 50).at_least(1.0),
                ParamSpec::float("tolerance", 1e-6).positive(),
            ],
            Self::LandmarkAlignment => vec![ParamSpec::int("landmark_count", 3).at_least(3.0)],
            Self::BoundingBoxCrop => ["min_x", "min_y", "min_z", "max_x", "max_y", "max_z"]
                .into_iter()
                .map(|name| ParamSpec::optional(name, ParamType::Float))
                .collect(),
            Self::SphericalCrop => vec![ParamSpec::float("radius", 10.0).positive()],
            Self::PlanarCrop => vec![ParamSpec::float("offset", 0.0)],
            Self::CurvatureBasedSegmentation => {
                vec![ParamSpec::float("threshold", 0.5).at_least(0.0)]
            }
            Self::ClusteringSegmentation => vec![ParamSpec::int("clusters", 2).at_least(1.0)],
            Self::MachineLearningSegmentation => {
                vec![ParamSpec::required("model", ParamType::Text)]
            }
        }
    }
}

/// Parameters for one step, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepParams(BTreeMap<String, ParamValue>);

impl StepParams {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns a parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// Returns a float parameter.
    #[must_use]
    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    /// Returns an integer parameter.
    #[must_use]
    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParamValue::as_i64)
    }

    /// Returns a text parameter.
    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_str)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no parameters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Validates against `algorithm`'s schema and returns the normalized set.
    ///
    /// # Errors
    ///
    /// Unknown names, missing required parameters, type mismatches,
    /// non-finite floats, and out-of-bound values are rejected.
    pub fn normalize(&self, algorithm: AlgorithmKind) -> Result<Self, ConfigurationError> {
        let schema = algorithm.parameter_schema();

        if let Some(unknown) = self
            .0
            .keys()
            .find(|name| !schema.iter().any(|spec| spec.name == name.as_str()))
        {
            return Err(ConfigurationError::new(format!(
                "unknown parameter for {algorithm}"
            ))
            .with_field(unknown.clone()));
        }

        let mut out = BTreeMap::new();
        for spec in &schema {
            match (self.0.get(spec.name), &spec.default) {
                (Some(value), _) => {
                    out.insert(spec.name.to_string(), spec.check(value)?);
                }
                (None, Some(default)) => {
                    out.insert(spec.name.to_string(), default.clone());
                }
                (None, None) if spec.required => {
                    return Err(ConfigurationError::new("missing required parameter")
                        .with_field(spec.name));
                }
                (None, None) => {}
            }
        }

        if algorithm == AlgorithmKind::BoundingBoxCrop {
            for axis in ["x", "y", "z"] {
                let min = out.get(&format!("min_{axis}")).and_then(ParamValue::as_f64);
                let max = out.get(&format!("max_{axis}")).and_then(ParamValue::as_f64);
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(ConfigurationError::new(format!(
                            "min_{axis} {min} exceeds max_{axis} {max}"
                        ))
                        .with_field(format!("min_{axis}")));
                    }
                }
            }
        }

        Ok(Self(out))
    }

    /// Canonical encoding of the whole set, `name=value` joined by `;`.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{name}={}", value.canonical()))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for StepParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
