//! Deterministic meshes and fake geometry.

use crate::core::{Mesh, Outcome};
use crate::pipeline::{StepDefinition, StepKind, StepOutput, StepParams, StepRegistry};

/// A wavy grid mesh with `vertices` points.
///
/// The same count always yields byte-identical meshes.
#[must_use]
pub fn grid_mesh(vertices: usize) -> Mesh {
    let side = (1..).find(|s: &usize| s * s >= vertices).unwrap_or(1);
    let points = (0..vertices)
        .map(|i| {
            let (x, y) = (i % side, i / side);
            let z = ((x * 7 + y * 13) % 11) as f64 * 0.01;
            [x as f64 * 0.1, y as f64 * 0.1, z]
        })
        .collect();

    let mut faces = Vec::new();
    for y in 0..side.saturating_sub(1) {
        for x in 0..side - 1 {
            let a = y * side + x;
            let (b, c, d) = (a + 1, a + side, a + side + 1);
            if d < vertices {
                faces.push([index(a), index(b), index(c)]);
                faces.push([index(b), index(d), index(c)]);
            }
        }
    }
    Mesh::new(points, faces)
}

fn index(i: usize) -> u32 {
    u32::try_from(i).unwrap_or(u32::MAX)
}

/// Sum of every float parameter, used to make fake output depend on
/// configuration.
fn float_sum(params: &StepParams) -> f64 {
    params.iter().filter_map(|(_, v)| v.as_f64()).sum()
}

fn denoise(mesh: &Mesh, params: &StepParams) -> Outcome<StepOutput> {
    let damping = 1.0 / (1.0 + float_sum(params).abs());
    let vertices = mesh
        .vertices
        .iter()
        .map(|[x, y, z]| [*x, *y, z * damping])
        .collect();
    Outcome::Ok(StepOutput::new(Mesh::new(vertices, mesh.faces.clone())).with_metric("quality_score", 0.9))
}

/// Keeps every second vertex, snapped to the voxel grid, and the faces
/// whose corners all survive.
fn decimate(mesh: &Mesh, params: &StepParams) -> Outcome<StepOutput> {
    let voxel = params.f64("voxel_size").unwrap_or(0.05).max(f64::EPSILON);
    let snap = |v: f64| (v / voxel).round() * voxel;

    let mut remap = vec![None; mesh.vertex_count()];
    let mut vertices = Vec::with_capacity(mesh.vertex_count() / 2 + 1);
    for (i, [x, y, z]) in mesh.vertices.iter().enumerate().step_by(2) {
        remap[i] = Some(index(vertices.len()));
        vertices.push([snap(*x), snap(*y), snap(*z)]);
    }

    let lookup = |i: u32| remap.get(i as usize).copied().flatten();
    let faces = mesh
        .faces
        .iter()
        .filter_map(|[a, b, c]| Some([lookup(*a)?, lookup(*b)?, lookup(*c)?]))
        .collect();
    Outcome::Ok(StepOutput::new(Mesh::new(vertices, faces)))
}

fn shift(mesh: &Mesh, params: &StepParams) -> Outcome<StepOutput> {
    let offset = float_sum(params) * 1e-3;
    let vertices = mesh
        .vertices
        .iter()
        .map(|[x, y, z]| [x + offset, *y, *z])
        .collect();
    Outcome::Ok(StepOutput::new(Mesh::new(vertices, mesh.faces.clone())))
}

/// A registry with a deterministic fake for every algorithm.
///
/// Denoisers damp the z axis and report `quality_score`; decimators keep
/// every second vertex; everything else shifts the mesh slightly.
///
/// # Panics
///
/// Never in practice: each algorithm is registered exactly once.
#[must_use]
pub fn fake_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step in StepKind::ALL {
        for algorithm in step.algorithms() {
            let definition = match step {
                StepKind::Denoise => StepDefinition::new(denoise),
                StepKind::Decimate => StepDefinition::new(decimate),
                _ => StepDefinition::new(shift),
            };
            registry
                .register(*algorithm, definition.deterministic())
                .expect("each algorithm is registered once");
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfig;

    #[test]
    fn test_grid_mesh_is_stable() {
        let a = grid_mesh(100);
        assert_eq!(a.vertex_count(), 100);
        assert_eq!(a.face_count(), 2 * 9 * 9);
        assert_eq!(a.fingerprint(), grid_mesh(100).fingerprint());
    }

    #[test]
    fn test_fake_registry_is_complete() {
        let registry = fake_registry();
        registry.ensure_complete().unwrap();
        registry.check_config(&PipelineConfig::default_dental()).unwrap();
    }

    #[test]
    fn test_decimate_halves_vertices() {
        let mesh = grid_mesh(100);
        let Outcome::Ok(out) = decimate(&mesh, &StepParams::new()) else {
            panic!("decimate failed");
        };
        assert_eq!(out.mesh.vertex_count(), 50);
        let max = out.mesh.vertex_count() as u32;
        assert!(out.mesh.faces.iter().flatten().all(|i| *i < max));
    }
}
