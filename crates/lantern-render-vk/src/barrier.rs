// SPDX-License-Identifier: CEPL-1.0
//! Image layout transitions (synchronization2).

use ash::vk;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub old: vk::ImageLayout,
    pub new: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// Scene pass start: contents are cleared, so the old layout is discarded.
pub const UNDEFINED_TO_COLOR: Transition = Transition {
    old: vk::ImageLayout::UNDEFINED,
    new: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    src_access: vk::AccessFlags2::NONE,
    dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
};

/// Scene writes -> overlay loads and blends on top.
pub const COLOR_WRITE_TO_LOAD: Transition = Transition {
    old: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    new: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    dst_access: vk::AccessFlags2::from_raw(
        vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
    ),
};

pub const COLOR_TO_PRESENT: Transition = Transition {
    old: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    new: vk::ImageLayout::PRESENT_SRC_KHR,
    src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
    dst_access: vk::AccessFlags2::NONE,
};

pub const UNDEFINED_TO_DEPTH: Transition = Transition {
    old: vk::ImageLayout::UNDEFINED,
    new: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
    src_access: vk::AccessFlags2::NONE,
    dst_stage: vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
    ),
    dst_access: vk::AccessFlags2::from_raw(
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
    ),
};

/// Each frame clears the shared depth buffer; order it after the previous frame's tests.
pub const DEPTH_REUSE: Transition = Transition {
    old: vk::ImageLayout::UNDEFINED,
    new: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
    src_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    dst_stage: UNDEFINED_TO_DEPTH.dst_stage,
    dst_access: UNDEFINED_TO_DEPTH.dst_access,
};

pub const UNDEFINED_TO_TRANSFER_DST: Transition = Transition {
    old: vk::ImageLayout::UNDEFINED,
    new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
    src_access: vk::AccessFlags2::NONE,
    dst_stage: vk::PipelineStageFlags2::TRANSFER,
    dst_access: vk::AccessFlags2::TRANSFER_WRITE,
};

/// Mip level `i - 1` becomes the blit source for level `i`.
pub const TRANSFER_DST_TO_SRC: Transition = Transition {
    old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    new: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::TRANSFER,
    src_access: vk::AccessFlags2::TRANSFER_WRITE,
    dst_stage: vk::PipelineStageFlags2::TRANSFER,
    dst_access: vk::AccessFlags2::TRANSFER_READ,
};

pub const TRANSFER_SRC_TO_SHADER_READ: Transition = Transition {
    old: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::TRANSFER,
    src_access: vk::AccessFlags2::TRANSFER_READ,
    dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
    dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
};

pub const TRANSFER_DST_TO_SHADER_READ: Transition = Transition {
    old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::TRANSFER,
    src_access: vk::AccessFlags2::TRANSFER_WRITE,
    dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
    dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
};

pub fn subresource(
    aspect: vk::ImageAspectFlags,
    base_mip_level: u32,
    level_count: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn color_range() -> vk::ImageSubresourceRange {
    subresource(vk::ImageAspectFlags::COLOR, 0, 1)
}

#[inline]
pub unsafe fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    t: Transition,
) {
    let barrier = vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask: t.src_stage,
        src_access_mask: t.src_access,
        dst_stage_mask: t.dst_stage,
        dst_access_mask: t.dst_access,
        old_layout: t.old,
        new_layout: t.new,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: range,
        ..Default::default()
    };
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
}
