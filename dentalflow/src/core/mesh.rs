//! Triangle mesh value passed between pipeline steps.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 8] = b"DFMESH01";
const HEADER_LEN: usize = MAGIC.len() + 16;

/// Errors decoding the binary mesh format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshDecodeError {
    /// Missing or wrong magic bytes.
    #[error("not a mesh blob")]
    BadMagic,

    /// The declared counts do not match the payload length.
    #[error("mesh blob truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Length implied by the header.
        expected: usize,
        /// Actual length.
        actual: usize,
    },
}

/// An indexed triangle mesh.
///
/// The engine never interprets geometry; it only moves meshes between steps,
/// fingerprints them, and stores them in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    /// Vertex positions.
    pub vertices: Vec<[f64; 3]>,
    /// Triangles as vertex indices.
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    /// Creates a mesh from raw buffers.
    #[must_use]
    pub fn new(vertices: Vec<[f64; 3]>, faces: Vec<[u32; 3]>) -> Self {
        Self { vertices, faces }
    }

    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of faces.
    #[must_use]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Content fingerprint: hex SHA-256 of [`Mesh::to_bytes`].
    ///
    /// Two meshes share a fingerprint only if they are byte-identical.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.to_bytes()))
    }

    /// Encodes the mesh as a little-endian binary blob.
    ///
    /// Layout: magic, vertex count (u64), face count (u64), vertex
    /// coordinates (f64 each), face indices (u32 each).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.vertices.len() * 24 + self.faces.len() * 12);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.vertices.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.faces.len() as u64).to_le_bytes());
        for vertex in &self.vertices {
            for coord in vertex {
                out.extend_from_slice(&coord.to_le_bytes());
            }
        }
        for face in &self.faces {
            for index in face {
                out.extend_from_slice(&index.to_le_bytes());
            }
        }
        out
    }

    /// Decodes a blob produced by [`Mesh::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshDecodeError> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(MeshDecodeError::BadMagic);
        }
        let vertex_count = read_u64(bytes, MAGIC.len());
        let face_count = read_u64(bytes, MAGIC.len() + 8);

        let expected = usize::try_from(vertex_count)
            .ok()
            .and_then(|v| v.checked_mul(24))
            .zip(usize::try_from(face_count).ok().and_then(|f| f.checked_mul(12)))
            .and_then(|(v, f)| v.checked_add(f))
            .and_then(|body| body.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);
        if bytes.len() != expected {
            return Err(MeshDecodeError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let mut offset = HEADER_LEN;
        let vertices = bytes[offset..offset + vertex_count as usize * 24]
            .chunks_exact(24)
            .map(|chunk| {
                [
                    read_f64(chunk, 0),
                    read_f64(chunk, 8),
                    read_f64(chunk, 16),
                ]
            })
            .collect();
        offset += vertex_count as usize * 24;
        let faces = bytes[offset..]
            .chunks_exact(12)
            .map(|chunk| [read_u32(chunk, 0), read_u32(chunk, 4), read_u32(chunk, 8)])
            .collect();

        Ok(Self { vertices, faces })
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_f64(bytes: &[u8], at: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    f64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}
