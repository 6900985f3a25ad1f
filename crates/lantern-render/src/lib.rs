// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;

pub mod frame;
pub mod mesh;
pub mod text;
pub mod uniforms;

pub use frame::{FrameBackend, FrameLoop, FrameOutcome, SurfaceInvalid, SwapchainOutcome};
pub use mesh::{MeshData, Vertex};
pub use uniforms::{ModelUniform, SceneUniforms};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

/// What the frame loop needs from the window it presents into.
pub trait DrawableSurface {
    /// Current drawable size in physical pixels; 0x0 while minimized.
    fn drawable_size(&self) -> RenderSize;

    /// True once per resize/minimize notification since the last call.
    fn take_resized(&mut self) -> bool;

    /// Block until at least one window event arrived. Returns false if the window is closing.
    fn wait_events(&mut self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PresentPreference {
    Fifo,
    #[default]
    Mailbox,
}

/// Renderer knobs resolved from config and CLI.
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub present: PresentPreference,
    pub validation: bool,
    pub shader_dir: Option<PathBuf>,
    /// Directory for the pipeline cache blob.
    pub pipeline_cache_dir: Option<PathBuf>,
    pub overlay_enabled: bool,
    pub font_atlas: Option<PathBuf>,
    pub glyph_px: f32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            present: PresentPreference::Mailbox,
            validation: true,
            shader_dir: None,
            pipeline_cache_dir: None,
            overlay_enabled: true,
            font_atlas: None,
            glyph_px: 16.0,
        }
    }
}

/// A model handed to the renderer for upload. The texture is decoded by the backend.
#[derive(Clone, Debug)]
pub struct ModelDesc {
    pub mesh: MeshData,
    pub texture: Option<PathBuf>,
}

pub trait Renderer {
    /// `models` fixes the texture count; descriptor pools are sized from it once.
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: &RenderOptions,
        models: &[ModelDesc],
    ) -> Result<Self>
    where
        Self: Sized;

    fn render(
        &mut self,
        surface: &mut dyn DrawableSurface,
        uniforms: &SceneUniforms,
    ) -> Result<FrameOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes() {
        assert!(RenderSize { width: 0, height: 600 }.is_zero());
        assert!(RenderSize { width: 800, height: 0 }.is_zero());
        assert!(!RenderSize { width: 1, height: 1 }.is_zero());
    }

    #[test]
    fn aspect_never_divides_by_zero() {
        assert_eq!(RenderSize { width: 800, height: 400 }.aspect(), 2.0);
        assert_eq!(RenderSize { width: 0, height: 0 }.aspect(), 1.0);
    }
}
