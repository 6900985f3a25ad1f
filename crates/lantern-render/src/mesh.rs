// SPDX-License-Identifier: CEPL-1.0
use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use std::path::Path;
use tracing::{debug, info};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Unit cube centred on the origin, 4 vertices per face, CCW outward.
    pub fn cube() -> Self {
        // (normal, u axis, v axis) per face
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];
        let mut mesh = MeshData::default();
        for (n, u, v) in faces {
            let base = mesh.vertices.len() as u32;
            for (su, sv) in [(-1.0f32, -1.0f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let p = [
                    0.5 * (n[0] + su * u[0] + sv * v[0]),
                    0.5 * (n[1] + su * u[1] + sv * v[1]),
                    0.5 * (n[2] + su * u[2] + sv * v[2]),
                ];
                mesh.vertices.push(Vertex {
                    position: p,
                    normal: n,
                    color: [1.0, 1.0, 1.0],
                    uv: [(su + 1.0) * 0.5, 1.0 - (sv + 1.0) * 0.5],
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }
}

/// Load every shape of an OBJ file into one indexed mesh.
pub fn load_obj(path: &Path) -> Result<MeshData> {
    let (models, _materials) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS)
        .with_context(|| format!("tobj::load_obj({})", path.display()))?;

    let mut out = MeshData::default();
    for model in &models {
        let m = &model.mesh;
        let base = out.vertices.len() as u32;
        let count = m.positions.len() / 3;
        for i in 0..count {
            let position = [m.positions[3 * i], m.positions[3 * i + 1], m.positions[3 * i + 2]];
            let normal = if m.normals.len() >= 3 * (i + 1) {
                [m.normals[3 * i], m.normals[3 * i + 1], m.normals[3 * i + 2]]
            } else {
                [0.0, 1.0, 0.0]
            };
            let color = if m.vertex_color.len() >= 3 * (i + 1) {
                [
                    m.vertex_color[3 * i],
                    m.vertex_color[3 * i + 1],
                    m.vertex_color[3 * i + 2],
                ]
            } else {
                [1.0, 1.0, 1.0]
            };
            // OBJ v runs bottom-up; Vulkan samples top-down
            let uv = if m.texcoords.len() >= 2 * (i + 1) {
                [m.texcoords[2 * i], 1.0 - m.texcoords[2 * i + 1]]
            } else {
                [0.0, 0.0]
            };
            out.vertices.push(Vertex {
                position,
                normal,
                color,
                uv,
            });
        }
        out.indices.extend(m.indices.iter().map(|&i| base + i));
        debug!("obj shape '{}': {} vertices", model.name, count);
    }

    if out.indices.is_empty() {
        bail!("{} contains no triangles", path.display());
    }
    info!(
        "mesh {}: {} vertices, {} indices",
        path.display(),
        out.vertices.len(),
        out.indices.len()
    );
    Ok(out)
}
