// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Per-frame camera and model state supplied by the application.
#[derive(Clone, Debug)]
pub struct SceneUniforms {
    pub view: Mat4,
    pub proj: Mat4,
    pub camera_pos: Vec3,
    pub light_pos: Vec3,
    /// World transform per model, indexed like the models given to the renderer.
    pub model_transforms: Vec<Mat4>,
}

impl Default for SceneUniforms {
    fn default() -> Self {
        SceneUniforms {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            camera_pos: Vec3::ZERO,
            light_pos: Vec3::new(3.0, 3.0, 3.0),
            model_transforms: Vec::new(),
        }
    }
}

impl SceneUniforms {
    /// GPU block for model `m`; missing transforms fall back to identity.
    pub fn model_uniform(&self, m: usize) -> ModelUniform {
        let model = self
            .model_transforms
            .get(m)
            .copied()
            .unwrap_or(Mat4::IDENTITY);
        ModelUniform {
            model: model.to_cols_array_2d(),
            view: self.view.to_cols_array_2d(),
            proj: self.proj.to_cols_array_2d(),
            camera_pos: self.camera_pos.extend(1.0).to_array(),
            light_pos: self.light_pos.extend(1.0).to_array(),
        }
    }
}

/// Matches `layout(set = 0, binding = 0) uniform Ubo` in mesh.vert / mesh.frag.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ModelUniform {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub camera_pos: [f32; 4],
    pub light_pos: [f32; 4],
}
