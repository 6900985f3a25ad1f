// SPDX-License-Identifier: CEPL-1.0
//! Frame-slot and per-image synchronization objects.

use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use ash::vk;
use std::sync::Arc;

fn create_semaphore(d: &ash::Device) -> Result<vk::Semaphore, GpuError> {
    let ci = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    unsafe { d.create_semaphore(&ci, None) }.check("vkCreateSemaphore")
}

fn create_fence(d: &ash::Device, signaled: bool) -> Result<vk::Fence, GpuError> {
    let ci = vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        },
        ..Default::default()
    };
    unsafe { d.create_fence(&ci, None) }.check("vkCreateFence")
}

/// One image-available semaphore and one in-flight fence per frame slot.
/// Fences start signaled so the first wait on every slot returns at once.
pub struct SlotSync {
    ctx: Arc<DeviceContext>,
    pub image_available: Vec<vk::Semaphore>,
    pub in_flight: Vec<vk::Fence>,
}

impl SlotSync {
    pub fn new(ctx: &Arc<DeviceContext>, count: usize) -> Result<Self, GpuError> {
        let mut s = SlotSync {
            ctx: ctx.clone(),
            image_available: Vec::new(),
            in_flight: Vec::new(),
        };
        s.resize(count)?;
        Ok(s)
    }

    fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn wait(&self, slot: usize) -> Result<(), GpuError> {
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&self.in_flight[slot..=slot], true, u64::MAX)
        }
        .check("vkWaitForFences")
    }

    pub fn reset(&self, slot: usize) -> Result<(), GpuError> {
        unsafe { self.ctx.device.reset_fences(&self.in_flight[slot..=slot]) }
            .check("vkResetFences")
    }

    /// Called with the device idle. Unchanged count keeps every object.
    pub fn resize(&mut self, count: usize) -> Result<(), GpuError> {
        if count == self.len() {
            return Ok(());
        }
        self.destroy();
        let d = &self.ctx.device;
        for _ in 0..count {
            self.image_available.push(create_semaphore(d)?);
            self.in_flight.push(create_fence(d, true)?);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        let d = &self.ctx.device;
        unsafe {
            for s in self.image_available.drain(..) {
                d.destroy_semaphore(s, None);
            }
            for f in self.in_flight.drain(..) {
                d.destroy_fence(f, None);
            }
        }
    }
}

impl Drop for SlotSync {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Render-finished semaphores, one per swapchain image. Present waits on the
/// image's own semaphore, so reuse is bounded by the image guard.
pub struct ImageSync {
    ctx: Arc<DeviceContext>,
    pub render_finished: Vec<vk::Semaphore>,
}

impl ImageSync {
    pub fn new(ctx: &Arc<DeviceContext>) -> Self {
        ImageSync {
            ctx: ctx.clone(),
            render_finished: Vec::new(),
        }
    }

    /// Grow to at least `count` semaphores; extras from a larger chain stay.
    pub fn ensure(&mut self, count: usize) -> Result<(), GpuError> {
        while self.render_finished.len() < count {
            self.render_finished.push(create_semaphore(&self.ctx.device)?);
        }
        Ok(())
    }
}

impl Drop for ImageSync {
    fn drop(&mut self) {
        for s in self.render_finished.drain(..) {
            unsafe { self.ctx.device.destroy_semaphore(s, None) };
        }
    }
}
