// SPDX-License-Identifier: CEPL-1.0
//! Text overlay pass. Runs after the scene on the same image: loads the
//! color attachment, blends glyph quads over it and hands the image to
//! present.

use crate::barrier::{color_range, image_barrier, COLOR_TO_PRESENT, COLOR_WRITE_TO_LOAD};
use crate::commands::ImageCommands;
use crate::device::DeviceContext;
use crate::error::VkResultExt;
use crate::memory::{GpuBuffer, HOST_VISIBLE};
use crate::pipeline::{create_graphics_pipeline, load_spirv, GraphicsPipelineDesc, ShaderPaths};
use crate::texture::Texture;
use crate::upload::UploadContext;
use anyhow::{anyhow, Result};
use ash::vk;
use lantern_render::text::{GlyphVertex, TextAlign, TextBatch, OVERLAY_MAX_CHARS, VERTS_PER_GLYPH};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const VERTEX_BYTES: vk::DeviceSize =
    (OVERLAY_MAX_CHARS * VERTS_PER_GLYPH * std::mem::size_of::<GlyphVertex>()) as vk::DeviceSize;

/// Swapchain-bound half of the overlay, rebuilt with the chain.
struct Target {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    vertices: Vec<GpuBuffer>,
    pipeline: vk::Pipeline,
}

pub struct TextOverlay {
    ctx: Arc<DeviceContext>,
    enabled: bool,
    atlas: Texture,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    pub layout: vk::PipelineLayout,
    vert: Vec<u32>,
    frag: Vec<u32>,
    commands: ImageCommands,
    target: Option<Target>,
    batch: TextBatch,
}

impl TextOverlay {
    pub fn new(
        up: &UploadContext,
        shaders: &ShaderPaths,
        font_atlas: Option<&Path>,
        glyph_px: f32,
        enabled: bool,
    ) -> Result<Self> {
        let ctx = up.context().clone();
        let vert = load_spirv(&shaders.text_vert)?;
        let frag = load_spirv(&shaders.text_frag)?;
        let atlas = Texture::load_atlas(up, font_atlas)?;
        let commands = ImageCommands::new(&ctx)?;
        let d = &ctx.device;

        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        };
        let set_layout_ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        };
        let mut this = TextOverlay {
            ctx: ctx.clone(),
            enabled,
            atlas,
            set_layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
            layout: vk::PipelineLayout::null(),
            vert,
            frag,
            commands,
            target: None,
            batch: TextBatch::new(glyph_px),
        };
        this.set_layout = unsafe { d.create_descriptor_set_layout(&set_layout_ci, None) }
            .check("vkCreateDescriptorSetLayout")?;

        let size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        };
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &size,
            ..Default::default()
        };
        this.pool = unsafe { d.create_descriptor_pool(&pool_ci, None) }
            .check("vkCreateDescriptorPool")?;
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: this.pool,
            descriptor_set_count: 1,
            p_set_layouts: &this.set_layout,
            ..Default::default()
        };
        this.set = unsafe { d.allocate_descriptor_sets(&alloc) }
            .check("vkAllocateDescriptorSets")?[0];

        let image_info = vk::DescriptorImageInfo {
            sampler: this.atlas.sampler,
            image_view: this.atlas.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: this.set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &image_info,
            ..Default::default()
        };
        unsafe { d.update_descriptor_sets(std::slice::from_ref(&write), &[]) };

        let layout_ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &this.set_layout,
            ..Default::default()
        };
        this.layout = unsafe { d.create_pipeline_layout(&layout_ci, None) }
            .check("vkCreatePipelineLayout")?;
        Ok(this)
    }

    /// Vertex buffers, command buffers and the blended pipeline for a new chain.
    pub fn create(
        &mut self,
        images: &[vk::Image],
        views: &[vk::ImageView],
        format: vk::Format,
        extent: vk::Extent2D,
        cache: vk::PipelineCache,
    ) -> Result<()> {
        self.destroy();
        self.commands.ensure(images.len())?;
        let vertices = (0..images.len())
            .map(|_| {
                GpuBuffer::new(
                    &self.ctx,
                    VERTEX_BYTES,
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    HOST_VISIBLE,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<GlyphVertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = [vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: 0,
        }];
        let desc = GraphicsPipelineDesc {
            vert: &self.vert,
            frag: &self.frag,
            bindings: &bindings,
            attributes: &attributes,
            topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
            layout: self.layout,
            color_format: format,
            depth_format: None,
            extent: None,
            cull_mode: vk::CullModeFlags::NONE,
            alpha_blend: true,
        };
        let pipeline = unsafe { create_graphics_pipeline(&self.ctx.device, cache, &desc)? };

        self.target = Some(Target {
            images: images.to_vec(),
            views: views.to_vec(),
            extent,
            vertices,
            pipeline,
        });
        debug!("overlay ready for {} images", images.len());
        Ok(())
    }

    pub fn destroy(&mut self) {
        if let Some(t) = self.target.take() {
            unsafe { self.ctx.device.destroy_pipeline(t.pipeline, None) };
        }
    }

    // --- Text updates ---

    pub fn begin_text_update(&mut self) {
        let (w, h) = self
            .target
            .as_ref()
            .map_or((1, 1), |t| (t.extent.width, t.extent.height));
        self.batch.begin(w, h);
    }

    pub fn add_text(&mut self, text: &str, x: f32, y: f32, align: TextAlign) -> usize {
        self.batch.add(text, x, y, align)
    }

    pub fn end_text_update(&mut self) {
        self.batch.end();
    }

    /// Upload this frame's glyphs for `image` and re-record its overlay buffer.
    /// With nothing to draw only the hand-off to present is recorded.
    pub fn record(&mut self, image: usize) -> Result<()> {
        let t = self
            .target
            .as_ref()
            .ok_or_else(|| anyhow!("overlay recorded without a swapchain"))?;
        let glyphs = if self.enabled { self.batch.glyph_count() } else { 0 };
        if glyphs > 0 {
            t.vertices[image].write(0, bytemuck::cast_slice(self.batch.vertices()))?;
        }

        self.commands.record(image, |d, cmd| unsafe {
            if glyphs > 0 {
                draw_glyphs(d, cmd, t, image, self.layout, self.set, glyphs);
            }
            image_barrier(d, cmd, t.images[image], color_range(), COLOR_TO_PRESENT);
        })?;
        Ok(())
    }

    pub fn command_buffer(&self, image: usize) -> vk::CommandBuffer {
        self.commands.get(image)
    }
}

unsafe fn draw_glyphs(
    d: &ash::Device,
    cmd: vk::CommandBuffer,
    t: &Target,
    image: usize,
    layout: vk::PipelineLayout,
    set: vk::DescriptorSet,
    glyphs: usize,
) {
    image_barrier(d, cmd, t.images[image], color_range(), COLOR_WRITE_TO_LOAD);

    let color_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: t.views[image],
        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::LOAD,
        store_op: vk::AttachmentStoreOp::STORE,
        ..Default::default()
    };
    let area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: t.extent,
    };
    let rendering_info = vk::RenderingInfo {
        s_type: vk::StructureType::RENDERING_INFO,
        render_area: area,
        layer_count: 1,
        color_attachment_count: 1,
        p_color_attachments: &color_att,
        ..Default::default()
    };
    d.cmd_begin_rendering(cmd, &rendering_info);
    d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, t.pipeline);

    // pixel_to_ndc already puts y = -1 at the top
    let vp = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: t.extent.width as f32,
        height: t.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    d.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
    d.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));

    d.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, 0, &[set], &[]);
    d.cmd_bind_vertex_buffers(cmd, 0, &[t.vertices[image].buffer], &[0]);
    for g in 0..glyphs {
        d.cmd_draw(cmd, VERTS_PER_GLYPH as u32, 1, (g * VERTS_PER_GLYPH) as u32, 0);
    }
    d.cmd_end_rendering(cmd);
}

impl Drop for TextOverlay {
    fn drop(&mut self) {
        self.destroy();
        let d = &self.ctx.device;
        unsafe {
            if self.layout != vk::PipelineLayout::null() {
                d.destroy_pipeline_layout(self.layout, None);
            }
            if self.pool != vk::DescriptorPool::null() {
                d.destroy_descriptor_pool(self.pool, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                d.destroy_descriptor_set_layout(self.set_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_buffer_fits_a_full_batch() {
        assert_eq!(std::mem::size_of::<GlyphVertex>(), 16);
        assert_eq!(VERTEX_BYTES, (OVERLAY_MAX_CHARS * 4 * 16) as u64);
    }
}
