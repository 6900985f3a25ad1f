// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("{call} failed: {code:?} ({})", .code.as_raw())]
    Call {
        call: &'static str,
        code: vk::Result,
    },
    #[error("no physical device supports graphics, present and the required extensions")]
    NoSuitableDevice,
    #[error("no {0} queue family")]
    MissingQueueFamily(&'static str),
    #[error("no memory type in bits {type_bits:#b} with {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },
    #[error("no supported depth format")]
    NoDepthFormat,
    #[error("write of {len} bytes at offset {offset} overruns a {size} byte buffer")]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: usize,
        size: vk::DeviceSize,
    },
    #[error("refusing to upload 0 bytes")]
    EmptyUpload,
    #[error("shader {}: {source}", .path.display())]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),
    #[error("window handle unavailable: {0}")]
    Window(#[from] raw_window_handle::HandleError),
}

impl GpuError {
    /// The raw Vulkan code, if this came from a failed call.
    pub fn code(&self) -> Option<vk::Result> {
        match self {
            GpuError::Call { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Attach the call name to a raw `VkResult`.
pub trait VkResultExt<T> {
    fn check(self, call: &'static str) -> Result<T, GpuError>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn check(self, call: &'static str) -> Result<T, GpuError> {
        self.map_err(|code| GpuError::Call { call, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_errors_carry_name_and_numeric_code() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .check("vkQueueSubmit")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vkQueueSubmit"));
        assert!(msg.contains("-4"));
        assert_eq!(err.code(), Some(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn ok_passes_through() {
        assert_eq!(Ok::<_, vk::Result>(7u32).check("vkNothing").unwrap(), 7);
    }
}
