//! Step and repository doubles.

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::{JobId, Mesh, Outcome};
use crate::pipeline::{StepDefinition, StepOutput, StepParams};
use crate::worker::MeshRepository;

/// A deterministic step that always fails.
///
/// `retryable` picks between [`Outcome::Retryable`] and [`Outcome::Fatal`].
#[must_use]
pub fn failing_step(message: &str, retryable: bool) -> StepDefinition {
    let message = message.to_string();
    StepDefinition::new(move |_, _| {
        if retryable {
            Outcome::Retryable(message.clone())
        } else {
            Outcome::Fatal(message.clone())
        }
    })
    .deterministic()
}

/// A step that halves every coordinate and is not declared deterministic.
#[must_use]
pub fn scale_step() -> StepDefinition {
    StepDefinition::new(|mesh: &Mesh, _| {
        let vertices = mesh.vertices.iter().map(|v| v.map(|c| c * 0.5)).collect();
        Outcome::Ok(StepOutput::new(Mesh::new(vertices, mesh.faces.clone())))
    })
}

/// Wraps a definition so every invocation bumps the returned counter.
#[must_use]
pub fn counting_step(inner: StepDefinition) -> (StepDefinition, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let func = Arc::clone(&inner.func);
    let wrapped = StepDefinition {
        func: Arc::new(move |mesh: &Mesh, params: &StepParams| {
            counter.fetch_add(1, Ordering::SeqCst);
            func(mesh, params)
        }),
        ..inner
    };
    (wrapped, calls)
}

/// In-memory [`MeshRepository`] that keeps every stored output.
#[derive(Debug, Default)]
pub struct RecordingMeshRepository {
    inputs: DashMap<String, Mesh>,
    stored: Mutex<Vec<(JobId, Mesh)>>,
}

impl RecordingMeshRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an input mesh.
    #[must_use]
    pub fn with_mesh(self, file_id: impl Into<String>, mesh: Mesh) -> Self {
        self.inputs.insert(file_id.into(), mesh);
        self
    }

    /// Outputs stored so far, in order.
    #[must_use]
    pub fn stored(&self) -> Vec<(JobId, Mesh)> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl MeshRepository for RecordingMeshRepository {
    async fn load(&self, file_id: &str) -> anyhow::Result<Mesh> {
        self.inputs
            .get(file_id)
            .map(|m| m.clone())
            .ok_or_else(|| anyhow!("no mesh stored under {file_id}"))
    }

    async fn store(&self, job_id: JobId, mesh: &Mesh) -> anyhow::Result<String> {
        self.stored.lock().push((job_id, mesh.clone()));
        Ok(format!("{job_id}.out"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repository_round_trip() {
        let repo = RecordingMeshRepository::new().with_mesh("in", Mesh::default());
        assert!(repo.load("in").await.is_ok());
        assert!(repo.load("missing").await.is_err());

        let id = JobId::new();
        assert_eq!(repo.store(id, &Mesh::default()).await.unwrap(), format!("{id}.out"));
        assert_eq!(repo.stored().len(), 1);
    }

    #[test]
    fn test_counting_step_counts() {
        let (step, calls) = counting_step(scale_step());
        assert!(!step.deterministic);
        let _ = (step.func)(&Mesh::default(), &StepParams::new());
        let _ = (step.func)(&Mesh::default(), &StepParams::new());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
