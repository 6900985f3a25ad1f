// SPDX-License-Identifier: CEPL-1.0
//! Device-resident meshes and their textures.

use crate::memory::GpuBuffer;
use crate::texture::Texture;
use crate::upload::{upload, UploadContext};
use anyhow::{bail, Context, Result};
use ash::vk;
use lantern_render::ModelDesc;
use tracing::info;

pub struct GpuModel {
    pub vertex: GpuBuffer,
    pub index: GpuBuffer,
    pub index_count: u32,
    pub texture: Texture,
}

impl GpuModel {
    /// Upload one model. `slot` is the model's position in the scene and doubles
    /// as its descriptor set index.
    pub fn upload(up: &mut UploadContext, desc: &ModelDesc, slot: usize) -> Result<Self> {
        let mesh = &desc.mesh;
        if mesh.indices.is_empty() {
            bail!("model {slot} has no triangles");
        }
        let vertex = upload(up, mesh.vertex_bytes(), vk::BufferUsageFlags::VERTEX_BUFFER)
            .with_context(|| format!("model {slot}: vertex buffer"))?;
        let index = upload(up, mesh.index_bytes(), vk::BufferUsageFlags::INDEX_BUFFER)
            .with_context(|| format!("model {slot}: index buffer"))?;
        let texture = Texture::load(up, desc.texture.as_deref(), slot)?;
        info!(
            "model {slot}: {} vertices, {} indices",
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(GpuModel {
            vertex,
            index,
            index_count: mesh.indices.len() as u32,
            texture,
        })
    }
}
