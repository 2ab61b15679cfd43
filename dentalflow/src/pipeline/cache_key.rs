//! Deterministic cache keys for step outputs.

use sha2::{Digest, Sha256};

use super::{AlgorithmKind, StepKind, StepParams};

/// Engine version folded into every key. A release that can change step
/// output invalidates all earlier entries.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const KEY_DOMAIN: &str = "dentalflow.step-cache.v1";

/// Inputs that determine a step's output bytes.
#[derive(Debug, Clone, Copy)]
pub struct CacheKeyInput<'a> {
    /// Fingerprint of the mesh entering the step.
    pub fingerprint: &'a str,
    /// The step.
    pub step_kind: StepKind,
    /// The algorithm.
    pub algorithm_kind: AlgorithmKind,
    /// Normalized parameters.
    pub parameters: &'a StepParams,
    /// Version of the registered step implementation.
    pub definition_version: u32,
}

impl CacheKeyInput<'_> {
    /// Computes the key: hex SHA-256 over every field plus the engine version.
    ///
    /// Fields are separated with a NUL byte. Parameter text is JSON-escaped
    /// by [`StepParams::canonical`], so no field can contain the separator.
    #[must_use]
    pub fn compute(&self) -> String {
        let definition_version = self.definition_version.to_string();
        let parameters = self.parameters.canonical();
        let mut hasher = Sha256::new();
        for field in [
            KEY_DOMAIN,
            ENGINE_VERSION,
            definition_version.as_str(),
            self.fingerprint,
            self.step_kind.as_str(),
            self.algorithm_kind.as_str(),
            parameters.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
