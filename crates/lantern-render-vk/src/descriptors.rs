// SPDX-License-Identifier: CEPL-1.0
//! Scene descriptors: one set per texture over a shared uniform arena.
//!
//! The arena is a single host-visible buffer split into `images x models`
//! aligned regions. Region `(k, m)` is written only while image `k` is
//! unguarded and read only by image `k`'s draw commands, through a dynamic
//! offset.

use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use crate::memory::{GpuBuffer, HOST_VISIBLE};
use anyhow::{bail, Result};
use ash::vk;
use lantern_render::{ModelUniform, SceneUniforms};
use std::sync::Arc;
use tracing::{debug, info};

pub const UNIFORM_SIZE: vk::DeviceSize = std::mem::size_of::<ModelUniform>() as vk::DeviceSize;

pub fn align_up(value: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaLayout {
    pub stride: vk::DeviceSize,
    pub models: usize,
    pub images: usize,
}

impl ArenaLayout {
    pub fn new(min_align: vk::DeviceSize, models: usize, images: usize) -> Self {
        ArenaLayout {
            stride: align_up(UNIFORM_SIZE, min_align),
            models,
            images,
        }
    }

    pub fn offset(&self, image: usize, model: usize) -> vk::DeviceSize {
        debug_assert!(image < self.images && model < self.models);
        (image * self.models + model) as vk::DeviceSize * self.stride
    }

    /// Never zero, so an empty scene still gets a valid buffer.
    pub fn total_size(&self) -> vk::DeviceSize {
        (self.images * self.models).max(1) as vk::DeviceSize * self.stride
    }

    /// All regions of one image, padded to the stride.
    pub fn image_bytes(&self, uniforms: &SceneUniforms) -> Vec<u8> {
        let mut bytes = vec![0u8; self.models * self.stride as usize];
        for m in 0..self.models {
            let at = m * self.stride as usize;
            let u = uniforms.model_uniform(m);
            bytes[at..at + UNIFORM_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&u));
        }
        bytes
    }
}

pub struct UniformArena {
    pub buffer: GpuBuffer,
    pub layout: ArenaLayout,
}

impl UniformArena {
    pub fn new(ctx: &Arc<DeviceContext>, layout: ArenaLayout) -> Result<Self, GpuError> {
        let buffer = GpuBuffer::new(
            ctx,
            layout.total_size(),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            HOST_VISIBLE,
        )?;
        debug!(
            "uniform arena: {} images x {} models, stride {}",
            layout.images, layout.models, layout.stride
        );
        Ok(UniformArena { buffer, layout })
    }

    /// Write every model region of `image`. Caller guarantees the image is not in flight.
    pub fn write_image(&self, image: usize, uniforms: &SceneUniforms) -> Result<(), GpuError> {
        if self.layout.models == 0 {
            return Ok(());
        }
        self.buffer
            .write(self.layout.offset(image, 0), &self.layout.image_bytes(uniforms))
    }

    /// Grow to cover `images`. Returns true if the buffer was replaced.
    pub fn ensure_images(&mut self, ctx: &Arc<DeviceContext>, images: usize) -> Result<bool, GpuError> {
        if images <= self.layout.images {
            return Ok(false);
        }
        let layout = ArenaLayout {
            images,
            ..self.layout
        };
        *self = UniformArena::new(ctx, layout)?;
        Ok(true)
    }
}

#[derive(Clone, Debug)]
pub struct PoolPlan {
    pub max_sets: u32,
    pub sizes: Vec<vk::DescriptorPoolSize>,
}

/// One set per texture, each with one dynamic uniform and one sampler.
pub fn plan_pool(textures: usize) -> PoolPlan {
    let n = textures as u32;
    PoolPlan {
        max_sets: n,
        sizes: vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: n,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: n,
            },
        ],
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SetBinding {
    pub uniform: vk::DescriptorBufferInfo,
    pub image: vk::DescriptorImageInfo,
}

/// Binding contents per set: the shared arena at offset 0, then that texture's view + sampler.
pub fn set_bindings(
    textures: &[(vk::ImageView, vk::Sampler)],
    arena: vk::Buffer,
    range: vk::DeviceSize,
) -> Vec<SetBinding> {
    textures
        .iter()
        .map(|&(image_view, sampler)| SetBinding {
            uniform: vk::DescriptorBufferInfo {
                buffer: arena,
                offset: 0,
                range,
            },
            image: vk::DescriptorImageInfo {
                sampler,
                image_view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        })
        .collect()
}

pub struct SceneDescriptors {
    ctx: Arc<DeviceContext>,
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    textures: Vec<(vk::ImageView, vk::Sampler)>,
}

impl SceneDescriptors {
    /// `textures` is final: the pool is sized from it once.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        textures: Vec<(vk::ImageView, vk::Sampler)>,
        arena: &UniformArena,
    ) -> Result<Self> {
        if textures.is_empty() {
            bail!("scene has no textures to bind");
        }
        let d = &ctx.device;
        let bindings = [
            vk::DescriptorSetLayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ];
        let layout_ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let layout = unsafe { d.create_descriptor_set_layout(&layout_ci, None) }
            .check("vkCreateDescriptorSetLayout")?;

        let plan = plan_pool(textures.len());
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: plan.max_sets,
            pool_size_count: plan.sizes.len() as u32,
            p_pool_sizes: plan.sizes.as_ptr(),
            ..Default::default()
        };
        // from here on Drop cleans up whatever exists
        let mut this = SceneDescriptors {
            ctx: ctx.clone(),
            layout,
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            textures,
        };
        this.pool = unsafe { d.create_descriptor_pool(&pool_ci, None) }
            .check("vkCreateDescriptorPool")?;

        let layouts = vec![layout; this.textures.len()];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: this.pool,
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        this.sets = unsafe { d.allocate_descriptor_sets(&alloc) }
            .check("vkAllocateDescriptorSets")?;
        this.write(arena, true);
        info!("descriptor pool: {} sets", plan.max_sets);
        Ok(this)
    }

    /// Point binding 0 of every set at a (new) arena buffer.
    /// Only while no command buffer using these sets is pending.
    pub fn rebind_arena(&self, arena: &UniformArena) {
        self.write(arena, false);
    }

    fn write(&self, arena: &UniformArena, with_images: bool) {
        let infos = set_bindings(&self.textures, arena.buffer.buffer, UNIFORM_SIZE);
        let mut writes = Vec::with_capacity(infos.len() * 2);
        for (set, info) in self.sets.iter().zip(&infos) {
            writes.push(vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: *set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                p_buffer_info: &info.uniform,
                ..Default::default()
            });
            if with_images {
                writes.push(vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: *set,
                    dst_binding: 1,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: &info.image,
                    ..Default::default()
                });
            }
        }
        unsafe { self.ctx.device.update_descriptor_sets(&writes, &[]) };
    }

    pub fn set(&self, texture: usize) -> vk::DescriptorSet {
        self.sets[texture]
    }
}

impl Drop for SceneDescriptors {
    fn drop(&mut self) {
        unsafe {
            // sets are freed with the pool
            if self.pool != vk::DescriptorPool::null() {
                self.ctx.device.destroy_descriptor_pool(self.pool, None);
            }
            self.ctx
                .device
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
