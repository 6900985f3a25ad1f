// SPDX-License-Identifier: CEPL-1.0
//! Buffers and images that own their memory and free it on drop.

use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use ash::vk;
use std::sync::Arc;

/// First memory type allowed by `type_bits` that has every flag in `flags`.
pub fn find_memory_type(
    mem_props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, GpuError> {
    (0..mem_props.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
        .ok_or(GpuError::NoMemoryType { type_bits, flags })
}

pub const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// `offset..offset + len` must lie inside a buffer of `size` bytes.
pub fn check_range(offset: vk::DeviceSize, len: usize, size: vk::DeviceSize) -> Result<(), GpuError> {
    match offset.checked_add(len as vk::DeviceSize) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::OutOfBounds { offset, len, size }),
    }
}

pub struct GpuBuffer {
    ctx: Arc<DeviceContext>,
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self, GpuError> {
        let d = &ctx.device;
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let buffer = d.create_buffer(&bci, None).check("vkCreateBuffer")?;
            let req = d.get_buffer_memory_requirements(buffer);
            let memory = find_memory_type(&ctx.mem_props, req.memory_type_bits, flags)
                .and_then(|memory_type_index| {
                    let mai = vk::MemoryAllocateInfo {
                        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                        allocation_size: req.size,
                        memory_type_index,
                        ..Default::default()
                    };
                    d.allocate_memory(&mai, None).check("vkAllocateMemory")
                });
            let memory = match memory {
                Ok(m) => m,
                Err(e) => {
                    d.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = d.bind_buffer_memory(buffer, memory, 0).check("vkBindBufferMemory") {
                d.destroy_buffer(buffer, None);
                d.free_memory(memory, None);
                return Err(e);
            }
            Ok(GpuBuffer {
                ctx: ctx.clone(),
                buffer,
                memory,
                size,
                usage,
            })
        }
    }

    /// Map, copy, unmap. Only valid on host-visible memory.
    pub fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<(), GpuError> {
        check_range(offset, bytes.len(), self.size)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let d = &self.ctx.device;
        unsafe {
            let ptr = d
                .map_memory(
                    self.memory,
                    offset,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .check("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            d.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_buffer(self.buffer, None);
            self.ctx.device.free_memory(self.memory, None);
        }
    }
}

/// 2D image + memory + one view covering every mip level.
pub struct GpuImage {
    ctx: Arc<DeviceContext>,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
}

impl GpuImage {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        mip_levels: u32,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self, GpuError> {
        let d = &ctx.device;
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        unsafe {
            let image = d.create_image(&img_ci, None).check("vkCreateImage")?;
            let req = d.get_image_memory_requirements(image);
            let memory = find_memory_type(
                &ctx.mem_props,
                req.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .and_then(|memory_type_index| {
                let mai = vk::MemoryAllocateInfo {
                    s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                    allocation_size: req.size,
                    memory_type_index,
                    ..Default::default()
                };
                d.allocate_memory(&mai, None).check("vkAllocateMemory")
            });
            let memory = match memory {
                Ok(m) => m,
                Err(e) => {
                    d.destroy_image(image, None);
                    return Err(e);
                }
            };

            let view_ci = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = d
                .bind_image_memory(image, memory, 0)
                .check("vkBindImageMemory")
                .and_then(|_| d.create_image_view(&view_ci, None).check("vkCreateImageView"));
            let view = match view {
                Ok(v) => v,
                Err(e) => {
                    d.destroy_image(image, None);
                    d.free_memory(memory, None);
                    return Err(e);
                }
            };

            Ok(GpuImage {
                ctx: ctx.clone(),
                image,
                memory,
                view,
                format,
                extent,
                mip_levels,
            })
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;
            d.destroy_image_view(self.view, None);
            d.destroy_image(self.image, None);
            d.free_memory(self.memory, None);
        }
    }
}
