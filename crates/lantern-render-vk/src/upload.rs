// SPDX-License-Identifier: CEPL-1.0
//! Staging uploads: host-visible staging -> device-local destination via a
//! one-time command buffer. Load-time only; never on the per-frame path.

use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use crate::memory::{GpuBuffer, HOST_VISIBLE};
use ash::vk;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Host-visible + coherent, mappable.
    Upload,
    DeviceLocal,
}

/// What the upload protocol needs from a device.
pub trait TransferQueue {
    type Buffer;

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self::Buffer, GpuError>;

    /// Copy `bytes` to the start of a host-visible buffer.
    fn write(&mut self, buf: &mut Self::Buffer, bytes: &[u8]) -> Result<(), GpuError>;

    /// Record, submit and wait for `src -> dst`.
    fn submit_copy(
        &mut self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: vk::DeviceSize,
    ) -> Result<(), GpuError>;

    fn destroy_buffer(&mut self, buf: Self::Buffer);
}

/// Upload `bytes` into a new device-local buffer with `usage | TRANSFER_DST`.
/// The staging buffer never outlives this call, on success or failure.
pub fn upload<Q: TransferQueue + ?Sized>(
    q: &mut Q,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<Q::Buffer, GpuError> {
    if bytes.is_empty() {
        return Err(GpuError::EmptyUpload);
    }
    let size = bytes.len() as vk::DeviceSize;

    let mut staging =
        q.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::Upload)?;
    if let Err(e) = q.write(&mut staging, bytes) {
        q.destroy_buffer(staging);
        return Err(e);
    }

    let dst = match q.create_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::DeviceLocal,
    ) {
        Ok(b) => b,
        Err(e) => {
            q.destroy_buffer(staging);
            return Err(e);
        }
    };

    let copied = q.submit_copy(&staging, &dst, size);
    q.destroy_buffer(staging);
    match copied {
        Ok(()) => Ok(dst),
        Err(e) => {
            q.destroy_buffer(dst);
            Err(e)
        }
    }
}

/// Transient command pool + fence on the graphics queue.
pub struct UploadContext {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
    fence: vk::Fence,
}

impl UploadContext {
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self, GpuError> {
        let d = &ctx.device;
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.families.graphics,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            ..Default::default()
        };
        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            ..Default::default()
        };
        unsafe {
            let pool = d
                .create_command_pool(&pool_info, None)
                .check("vkCreateCommandPool")?;
            let fence = match d.create_fence(&fence_info, None).check("vkCreateFence") {
                Ok(f) => f,
                Err(e) => {
                    d.destroy_command_pool(pool, None);
                    return Err(e);
                }
            };
            Ok(UploadContext {
                ctx: ctx.clone(),
                pool,
                fence,
            })
        }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Record `record` into a one-time buffer, submit it and wait on the fence.
    pub fn submit_once(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<(), GpuError> {
        let d = &self.ctx.device;
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        unsafe {
            let cmd = d
                .allocate_command_buffers(&ai)
                .check("vkAllocateCommandBuffers")?[0];
            let result = self.run(cmd, record);
            d.free_command_buffers(self.pool, std::slice::from_ref(&cmd));
            result
        }
    }

    unsafe fn run(
        &self,
        cmd: vk::CommandBuffer,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<(), GpuError> {
        let d = &self.ctx.device;
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &bi)
            .check("vkBeginCommandBuffer")?;
        record(d, cmd);
        d.end_command_buffer(cmd).check("vkEndCommandBuffer")?;

        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        d.queue_submit(self.ctx.graphics_queue, std::slice::from_ref(&si), self.fence)
            .check("vkQueueSubmit")?;
        d.wait_for_fences(std::slice::from_ref(&self.fence), true, u64::MAX)
            .check("vkWaitForFences")?;
        d.reset_fences(std::slice::from_ref(&self.fence))
            .check("vkResetFences")
    }

    /// Host-visible TRANSFER_SRC buffer holding `bytes`.
    pub fn stage(&self, bytes: &[u8]) -> Result<GpuBuffer, GpuError> {
        if bytes.is_empty() {
            return Err(GpuError::EmptyUpload);
        }
        let buf = GpuBuffer::new(
            &self.ctx,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_VISIBLE,
        )?;
        buf.write(0, bytes)?;
        Ok(buf)
    }
}

impl TransferQueue for UploadContext {
    type Buffer = GpuBuffer;

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<GpuBuffer, GpuError> {
        let flags = match location {
            MemoryLocation::Upload => HOST_VISIBLE,
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        GpuBuffer::new(&self.ctx, size, usage, flags)
    }

    fn write(&mut self, buf: &mut GpuBuffer, bytes: &[u8]) -> Result<(), GpuError> {
        buf.write(0, bytes)
    }

    fn submit_copy(
        &mut self,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        size: vk::DeviceSize,
    ) -> Result<(), GpuError> {
        debug!("staging copy: {size} bytes");
        self.submit_once(|d, cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            d.cmd_copy_buffer(cmd, src.buffer, dst.buffer, std::slice::from_ref(&region));
        })
    }

    fn destroy_buffer(&mut self, buf: GpuBuffer) {
        drop(buf);
    }
}

impl Drop for UploadContext {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_fence(self.fence, None);
            self.ctx.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct MockBuffer {
        id: u32,
        location: MemoryLocation,
        usage: vk::BufferUsageFlags,
    }

    #[derive(Default)]
    struct MockQueue {
        next: u32,
        live: HashMap<u32, Vec<u8>>,
        destroyed: Vec<u32>,
        fail_device_local: bool,
        fail_copy: bool,
    }

    impl TransferQueue for MockQueue {
        type Buffer = MockBuffer;

        fn create_buffer(
            &mut self,
            size: vk::DeviceSize,
            usage: vk::BufferUsageFlags,
            location: MemoryLocation,
        ) -> Result<MockBuffer, GpuError> {
            if location == MemoryLocation::DeviceLocal && self.fail_device_local {
                return Err(GpuError::Call {
                    call: "vkAllocateMemory",
                    code: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                });
            }
            self.next += 1;
            self.live.insert(self.next, vec![0; size as usize]);
            Ok(MockBuffer {
                id: self.next,
                location,
                usage,
            })
        }

        fn write(&mut self, buf: &mut MockBuffer, bytes: &[u8]) -> Result<(), GpuError> {
            assert_eq!(buf.location, MemoryLocation::Upload, "write to device-local memory");
            self.live.get_mut(&buf.id).unwrap()[..bytes.len()].copy_from_slice(bytes);
            Ok(())
        }

        fn submit_copy(
            &mut self,
            src: &MockBuffer,
            dst: &MockBuffer,
            size: vk::DeviceSize,
        ) -> Result<(), GpuError> {
            if self.fail_copy {
                return Err(GpuError::Call {
                    call: "vkQueueSubmit",
                    code: vk::Result::ERROR_DEVICE_LOST,
                });
            }
            let data = self.live[&src.id][..size as usize].to_vec();
            self.live.get_mut(&dst.id).unwrap()[..size as usize].copy_from_slice(&data);
            Ok(())
        }

        fn destroy_buffer(&mut self, buf: MockBuffer) {
            assert!(self.live.remove(&buf.id).is_some(), "double destroy of {}", buf.id);
            self.destroyed.push(buf.id);
        }
    }

    #[test]
    fn destination_holds_bytes_and_staging_is_gone() {
        let mut q = MockQueue::default();
        let bytes: Vec<u8> = (0..=255).collect();
        let dst = upload(&mut q, &bytes, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();

        assert_eq!(dst.location, MemoryLocation::DeviceLocal);
        assert!(dst
            .usage
            .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(q.live.len(), 1);
        assert_eq!(q.live[&dst.id], bytes);
        assert_eq!(q.destroyed, vec![1]);
    }

    #[test]
    fn empty_upload_is_rejected_before_any_allocation() {
        let mut q = MockQueue::default();
        assert!(matches!(
            upload(&mut q, &[], vk::BufferUsageFlags::INDEX_BUFFER),
            Err(GpuError::EmptyUpload)
        ));
        assert_eq!(q.next, 0);
    }

    #[test]
    fn failed_copy_frees_both_buffers() {
        let mut q = MockQueue {
            fail_copy: true,
            ..Default::default()
        };
        let err = upload(&mut q, &[1, 2, 3], vk::BufferUsageFlags::INDEX_BUFFER).unwrap_err();
        assert_eq!(err.code(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert!(q.live.is_empty());
        assert_eq!(q.destroyed.len(), 2);
    }

    #[test]
    fn failed_destination_frees_staging() {
        let mut q = MockQueue {
            fail_device_local: true,
            ..Default::default()
        };
        assert!(upload(&mut q, &[9; 16], vk::BufferUsageFlags::VERTEX_BUFFER).is_err());
        assert!(q.live.is_empty());
        assert_eq!(q.destroyed, vec![1]);
    }
}
