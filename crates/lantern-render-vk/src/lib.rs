// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: dynamic rendering, one swapchain image per frame slot,
//! a textured lit scene and a text overlay on top.

use anyhow::{anyhow, Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::{info, warn};

use lantern_render::frame::{
    Acquired, CommandStream, RebuildStage, ACQUIRE_TIMEOUT_NS, BUILD_ORDER,
};
use lantern_render::text::TextAlign;
use lantern_render::{
    DrawableSurface, FrameBackend, FrameLoop, FrameOutcome, ModelDesc, RenderOptions, RenderSize,
    Renderer, SceneUniforms, SwapchainOutcome,
};

pub mod barrier;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod memory;
pub mod model;
pub mod overlay;
pub mod pipeline;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod upload;

use commands::{record_scene, ImageCommands, SceneDraw};
use descriptors::{ArenaLayout, SceneDescriptors, UniformArena};
use device::DeviceContext;
use error::VkResultExt;
use model::GpuModel;
use overlay::TextOverlay;
use pipeline::{MeshPipeline, PipelineCache, ShaderPaths};
use swapchain::{depth_aspect, SwapchainHint, SwapchainManager};
use sync::{ImageSync, SlotSync};
use upload::UploadContext;

/// Device state driven by the frame loop. Fields drop top to bottom, so
/// everything built on the device goes before `ctx`.
pub struct VkBackend {
    overlay: TextOverlay,
    draw: ImageCommands,
    mesh: MeshPipeline,
    descriptors: SceneDescriptors,
    arena: UniformArena,
    models: Vec<GpuModel>,
    image_sync: ImageSync,
    slots: SlotSync,
    swapchain: SwapchainManager,
    cache: PipelineCache,
    upload: UploadContext,
    ctx: Arc<DeviceContext>,
    clear_color: [f32; 4],
}

impl VkBackend {
    /// Re-record every image's scene buffer. None of them may be in flight.
    fn record_all(&self) -> Result<()> {
        let pipeline = self
            .mesh
            .handle()
            .ok_or_else(|| anyhow!("scene recorded without a pipeline"))?;
        let extent = self.swapchain.extent().context("scene recorded without a swapchain")?;
        let depth_image = self.swapchain.depth_image().context("scene recorded without depth")?;
        let depth_view = self.swapchain.depth_view().context("scene recorded without depth")?;
        let images = self.swapchain.images();
        let views = self.swapchain.views();

        for (i, (&image, &view)) in images.iter().zip(views).enumerate() {
            let draw = SceneDraw {
                image,
                view,
                depth_image,
                depth_view,
                depth_aspect: depth_aspect(self.swapchain.depth_format()),
                extent,
                clear_color: self.clear_color,
                pipeline,
                layout: self.mesh.layout,
                descriptors: &self.descriptors,
                arena: &self.arena.layout,
                models: &self.models,
            };
            self.draw
                .record(i, |d, cmd| unsafe { record_scene(d, cmd, i, &draw) })?;
        }
        Ok(())
    }

    /// Per-image resources sized to the live chain, then recorded.
    fn prepare_images(&mut self) -> Result<()> {
        let n = self.swapchain.image_count();
        self.image_sync.ensure(n)?;
        if self.arena.ensure_images(&self.ctx, n)? {
            self.descriptors.rebind_arena(&self.arena);
        }
        self.draw.ensure(n)?;
        self.record_all()
    }
}

impl FrameBackend for VkBackend {
    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn surface_extent(&mut self, want: RenderSize) -> Result<RenderSize> {
        Ok(self.swapchain.surface_extent(want)?)
    }

    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        Ok(self.slots.wait(slot)?)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        Ok(self.slots.reset(slot)?)
    }

    fn acquire(&mut self, slot: usize) -> Result<SwapchainOutcome<Acquired>> {
        Ok(self
            .swapchain
            .acquire(self.slots.image_available[slot], ACQUIRE_TIMEOUT_NS)?)
    }

    fn write_uniforms(&mut self, image: usize, uniforms: &SceneUniforms) -> Result<()> {
        Ok(self.arena.write_image(image, uniforms)?)
    }

    fn record_overlay(&mut self, image: usize) -> Result<()> {
        self.overlay.record(image)
    }

    fn submit(&mut self, slot: usize, image: usize, batch: &[CommandStream]) -> Result<()> {
        let cmds: Vec<vk::CommandBuffer> = batch
            .iter()
            .map(|s| match s {
                CommandStream::Scene => self.draw.get(image),
                CommandStream::Overlay => self.overlay.command_buffer(image),
            })
            .collect();
        let wait = self.slots.image_available[slot];
        let signal = self.image_sync.render_finished[image];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: cmds.len() as u32,
            p_command_buffers: cmds.as_ptr(),
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.ctx.device.queue_submit(
                self.ctx.graphics_queue,
                std::slice::from_ref(&si),
                self.slots.in_flight[slot],
            )
        }
        .check("vkQueueSubmit")?;
        Ok(())
    }

    fn present(&mut self, image: usize) -> Result<SwapchainOutcome<bool>> {
        Ok(self
            .swapchain
            .present(image, self.image_sync.render_finished[image])?)
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(self.ctx.wait_idle()?)
    }

    fn destroy_stage(&mut self, stage: RebuildStage) {
        match stage {
            RebuildStage::Pipeline => self.mesh.destroy(),
            RebuildStage::Views => self.swapchain.destroy_views(),
            RebuildStage::Depth => self.swapchain.destroy_depth(),
            RebuildStage::Swapchain => self.swapchain.destroy_chain(),
            RebuildStage::Overlay => self.overlay.destroy(),
            // re-recorded in place
            RebuildStage::DrawCommands => {}
        }
    }

    fn create_stage(&mut self, stage: RebuildStage, size: RenderSize) -> Result<()> {
        match stage {
            RebuildStage::Swapchain => self.swapchain.create(size),
            RebuildStage::Views => self.swapchain.create_views(),
            RebuildStage::Depth => self.swapchain.create_depth(&self.upload),
            RebuildStage::Overlay => {
                let format = self.swapchain.format().context("overlay before swapchain")?;
                let extent = self.swapchain.extent().context("overlay before swapchain")?;
                self.overlay.create(
                    self.swapchain.images(),
                    self.swapchain.views(),
                    format,
                    extent,
                    self.cache.cache,
                )
            }
            RebuildStage::Pipeline => {
                let format = self.swapchain.format().context("pipeline before swapchain")?;
                let extent = self.swapchain.extent().context("pipeline before swapchain")?;
                self.mesh.create(
                    self.cache.cache,
                    format,
                    self.swapchain.depth_format(),
                    extent,
                )
            }
            RebuildStage::DrawCommands => self.prepare_images(),
        }
    }

    fn resize_slots(&mut self, count: usize) -> Result<()> {
        Ok(self.slots.resize(count)?)
    }
}

impl Drop for VkBackend {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            warn!("vk: wait idle on shutdown: {e}");
        }
    }
}

pub struct VkRenderer {
    frames: FrameLoop,
    backend: VkBackend,
}

impl VkRenderer {
    pub fn frame_loop(&self) -> &FrameLoop {
        &self.frames
    }

    pub fn begin_text_update(&mut self) {
        self.backend.overlay.begin_text_update();
    }

    pub fn add_text(&mut self, text: &str, x: f32, y: f32, align: TextAlign) -> usize {
        self.backend.overlay.add_text(text, x, y, align)
    }

    pub fn end_text_update(&mut self) {
        self.backend.overlay.end_text_update();
    }
}

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    options: &RenderOptions,
    descs: &[ModelDesc],
) -> Result<VkRenderer> {
    let ctx = Arc::new(DeviceContext::new(window, display, options.validation)?);
    let mut upload = UploadContext::new(&ctx)?;
    let shaders = ShaderPaths::resolve(options.shader_dir.as_deref());
    let cache = PipelineCache::load(&ctx, options.pipeline_cache_dir.as_deref())?;

    let models = descs
        .iter()
        .enumerate()
        .map(|(i, d)| GpuModel::upload(&mut upload, d, i))
        .collect::<Result<Vec<_>>>()?;

    // images: 0 until the first chain exists; grown in prepare_images
    let arena = UniformArena::new(
        &ctx,
        ArenaLayout::new(ctx.min_uniform_alignment(), models.len(), 0),
    )?;
    let textures = models
        .iter()
        .map(|m| (m.texture.view(), m.texture.sampler))
        .collect();
    let descriptors = SceneDescriptors::new(&ctx, textures, &arena)?;
    let mesh = MeshPipeline::new(&ctx, descriptors.layout, &shaders)?;
    let overlay = TextOverlay::new(
        &upload,
        &shaders,
        options.font_atlas.as_deref(),
        options.glyph_px,
        options.overlay_enabled,
    )?;
    let swapchain = SwapchainManager::new(
        &ctx,
        SwapchainHint {
            vsync: options.vsync,
            present: options.present,
        },
    )?;

    let mut backend = VkBackend {
        overlay,
        draw: ImageCommands::new(&ctx)?,
        mesh,
        descriptors,
        arena,
        models,
        image_sync: ImageSync::new(&ctx),
        slots: SlotSync::new(&ctx, 0)?,
        swapchain,
        cache,
        upload,
        ctx,
        clear_color: options.clear_color,
    };

    let extent = backend.surface_extent(size)?;
    if size.is_zero() || extent.is_zero() {
        // the first step builds the chain once the surface has an area
        info!("vk: surface is 0x0, swapchain deferred");
        let mut frames = FrameLoop::new(0);
        frames.request_rebuild();
        return Ok(VkRenderer { frames, backend });
    }

    for stage in BUILD_ORDER {
        backend
            .create_stage(stage, extent)
            .with_context(|| format!("initial {stage:?}"))?;
    }
    let n = backend.image_count();
    backend.resize_slots(n)?;
    info!(
        "vk: ready, {} images / {} slots, {} models",
        n,
        n,
        backend.models.len()
    );

    Ok(VkRenderer {
        frames: FrameLoop::new(n),
        backend,
    })
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: &RenderOptions,
        models: &[ModelDesc],
    ) -> Result<Self> {
        unsafe { build_renderer(window, display, size, options, models) }
    }

    // STRICT PER-FRAME ORDER lives in FrameLoop::step.
    fn render(
        &mut self,
        surface: &mut dyn DrawableSurface,
        uniforms: &SceneUniforms,
    ) -> Result<FrameOutcome> {
        self.frames.step(&mut self.backend, surface, uniforms)
    }
}
