// SPDX-License-Identifier: CEPL-1.0
//! Per-image command buffers and scene recording.

use crate::barrier::{color_range, image_barrier, subresource, DEPTH_REUSE, UNDEFINED_TO_COLOR};
use crate::descriptors::{ArenaLayout, SceneDescriptors};
use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use crate::model::GpuModel;
use ash::vk;
use std::sync::Arc;

/// One resettable primary command buffer per swapchain image.
/// Buffer `i` is only re-recorded while image `i` is not in flight.
pub struct ImageCommands {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl ImageCommands {
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self, GpuError> {
        let ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: ctx.families.graphics,
            ..Default::default()
        };
        let pool = unsafe { ctx.device.create_command_pool(&ci, None) }
            .check("vkCreateCommandPool")?;
        Ok(ImageCommands {
            ctx: ctx.clone(),
            pool,
            buffers: Vec::new(),
        })
    }

    /// Grow to `count` buffers. Never shrinks; extras are simply unused.
    pub fn ensure(&mut self, count: usize) -> Result<(), GpuError> {
        if count <= self.buffers.len() {
            return Ok(());
        }
        let info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: (count - self.buffers.len()) as u32,
            ..Default::default()
        };
        let more = unsafe { self.ctx.device.allocate_command_buffers(&info) }
            .check("vkAllocateCommandBuffers")?;
        self.buffers.extend(more);
        Ok(())
    }

    pub fn get(&self, image: usize) -> vk::CommandBuffer {
        self.buffers[image]
    }

    /// Reset buffer `image`, run `body` between begin and end.
    pub fn record(
        &self,
        image: usize,
        body: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<vk::CommandBuffer, GpuError> {
        let d = &self.ctx.device;
        let cmd = self.buffers[image];
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .check("vkResetCommandBuffer")?;
            d.begin_command_buffer(cmd, &begin)
                .check("vkBeginCommandBuffer")?;
            body(d, cmd);
            d.end_command_buffer(cmd).check("vkEndCommandBuffer")?;
        }
        Ok(cmd)
    }
}

impl Drop for ImageCommands {
    fn drop(&mut self) {
        // buffers go with the pool
        unsafe { self.ctx.device.destroy_command_pool(self.pool, None) };
    }
}

/// Everything the scene pass of one swapchain image reads.
pub struct SceneDraw<'a> {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub depth_aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptors: &'a SceneDescriptors,
    pub arena: &'a ArenaLayout,
    pub models: &'a [GpuModel],
}

/// Clear, draw every model with its own texture set and uniform region.
/// Leaves the color image in COLOR_ATTACHMENT_OPTIMAL for the overlay.
pub unsafe fn record_scene(d: &ash::Device, cmd: vk::CommandBuffer, image_index: usize, s: &SceneDraw<'_>) {
    image_barrier(d, cmd, s.image, color_range(), UNDEFINED_TO_COLOR);
    image_barrier(d, cmd, s.depth_image, subresource(s.depth_aspect, 0, 1), DEPTH_REUSE);

    let color_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: s.view,
        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        clear_value: vk::ClearValue {
            color: vk::ClearColorValue {
                float32: s.clear_color,
            },
        },
        ..Default::default()
    };
    let depth_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: s.depth_view,
        image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        clear_value: vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
        ..Default::default()
    };
    let rendering_info = vk::RenderingInfo {
        s_type: vk::StructureType::RENDERING_INFO,
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: s.extent,
        },
        layer_count: 1,
        color_attachment_count: 1,
        p_color_attachments: &color_att,
        p_depth_attachment: &depth_att,
        ..Default::default()
    };
    d.cmd_begin_rendering(cmd, &rendering_info);
    d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, s.pipeline);

    for (m, model) in s.models.iter().enumerate() {
        let set = s.descriptors.set(model.texture.descriptor_index);
        let offset = s.arena.offset(image_index, m) as u32;
        d.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            s.layout,
            0,
            &[set],
            &[offset],
        );
        d.cmd_bind_vertex_buffers(cmd, 0, &[model.vertex.buffer], &[0]);
        d.cmd_bind_index_buffer(cmd, model.index.buffer, 0, vk::IndexType::UINT32);
        d.cmd_draw_indexed(cmd, model.index_count, 1, 0, 0, 0);
    }

    d.cmd_end_rendering(cmd);
}
