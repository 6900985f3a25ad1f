// SPDX-License-Identifier: CEPL-1.0
//! Swapchain, its color views and the depth attachment.
//!
//! Each piece is an `Option` (or empty `Vec`) so the rebuild protocol can
//! destroy them in any order and more than once.

use crate::barrier::{image_barrier, subresource, UNDEFINED_TO_DEPTH};
use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use crate::memory::GpuImage;
use crate::upload::UploadContext;
use anyhow::{bail, Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use lantern_render::frame::Acquired;
use lantern_render::{PresentPreference, RenderSize, SurfaceInvalid, SwapchainOutcome};
use std::sync::Arc;
use tracing::{debug, info};

/// Stencil formats first; the first one usable as an optimal-tiled depth attachment wins.
pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainHint {
    pub vsync: bool,
    pub present: PresentPreference,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// FIFO is always available, so it is the fallback for every preference.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], hint: SwapchainHint) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = match (hint.vsync, hint.present) {
        (false, _) => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
        (true, PresentPreference::Mailbox) => &[vk::PresentModeKHR::MAILBOX],
        (true, PresentPreference::Fifo) => &[],
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// None while the surface has no area (minimized, or caps not caught up yet).
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> Option<vk::Extent2D> {
    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    };
    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// One more than the minimum, capped by the maximum (0 == no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

/// View formats for a mutable-format swapchain, `None` for non 8-bit RGBA/BGRA formats.
pub fn mutable_format_list(format: vk::Format) -> Option<Vec<vk::Format>> {
    const EIGHT_BIT: [vk::Format; 4] = [
        vk::Format::R8G8B8A8_SRGB,
        vk::Format::R8G8B8A8_UNORM,
        vk::Format::B8G8R8A8_SRGB,
        vk::Format::B8G8R8A8_UNORM,
    ];
    if !EIGHT_BIT.contains(&format) {
        return None;
    }
    let mut list = vec![format];
    for f in [vk::Format::R8G8B8A8_SRGB, vk::Format::B8G8R8A8_SRGB] {
        if !list.contains(&f) {
            list.push(f);
        }
    }
    Some(list)
}

pub fn pick_depth_format(
    mut supports_depth_attachment: impl FnMut(vk::Format) -> bool,
) -> Result<vk::Format, GpuError> {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&f| supports_depth_attachment(f))
        .ok_or(GpuError::NoDepthFormat)
}

pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Only OUT_OF_DATE is recoverable; SUBOPTIMAL arrives as `Ok((_, true))`.
pub fn classify_acquire(
    result: VkResult<(u32, bool)>,
) -> Result<SwapchainOutcome<Acquired>, GpuError> {
    match result {
        Ok((index, suboptimal)) => Ok(SwapchainOutcome::Ready(Acquired {
            image: index as usize,
            suboptimal,
        })),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            Ok(SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate))
        }
        Err(code) => Err(GpuError::Call {
            call: "vkAcquireNextImageKHR",
            code,
        }),
    }
}

pub fn classify_present(result: VkResult<bool>) -> Result<SwapchainOutcome<bool>, GpuError> {
    match result {
        Ok(suboptimal) => Ok(SwapchainOutcome::Ready(suboptimal)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            Ok(SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate))
        }
        Err(code) => Err(GpuError::Call {
            call: "vkQueuePresentKHR",
            code,
        }),
    }
}

struct Chain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

pub struct SwapchainManager {
    ctx: Arc<DeviceContext>,
    chain: Option<Chain>,
    views: Vec<vk::ImageView>,
    depth: Option<GpuImage>,
    depth_format: vk::Format,
    hint: SwapchainHint,
}

impl SwapchainManager {
    pub fn new(ctx: &Arc<DeviceContext>, hint: SwapchainHint) -> Result<Self, GpuError> {
        let depth_format = pick_depth_format(|f| {
            ctx.format_features(f)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })?;
        debug!("depth format {:?}", depth_format);
        Ok(SwapchainManager {
            ctx: ctx.clone(),
            chain: None,
            views: Vec::new(),
            depth: None,
            depth_format,
            hint,
        })
    }

    fn surface_caps(&self) -> Result<vk::SurfaceCapabilitiesKHR, GpuError> {
        unsafe {
            self.ctx
                .base
                .surface_loader
                .get_physical_device_surface_capabilities(self.ctx.phys, self.ctx.base.surface)
        }
        .check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    /// Extent a chain created now would get for a `want` sized window; 0x0 while
    /// the surface has no area.
    pub fn surface_extent(&self, want: RenderSize) -> Result<RenderSize, GpuError> {
        let extent = choose_extent(&self.surface_caps()?, want);
        Ok(extent.map_or(
            RenderSize {
                width: 0,
                height: 0,
            },
            |e| RenderSize {
                width: e.width,
                height: e.height,
            },
        ))
    }

    pub fn create(&mut self, size: RenderSize) -> Result<()> {
        if self.chain.is_some() {
            bail!("swapchain created twice without a destroy");
        }
        let caps = self.surface_caps()?;
        let ctx = &self.ctx;
        let (formats, modes) = unsafe {
            let s = &ctx.base.surface_loader;
            (
                s.get_physical_device_surface_formats(ctx.phys, ctx.base.surface)
                    .check("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                s.get_physical_device_surface_present_modes(ctx.phys, ctx.base.surface)
                    .check("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            )
        };

        let format = choose_surface_format(&formats).context("surface reports no formats")?;
        let present_mode = choose_present_mode(&modes, self.hint);
        let extent = choose_extent(&caps, size).context("surface extent is 0x0")?;
        let min_image_count = choose_image_count(&caps);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let family_indices = [ctx.families.graphics, ctx.families.present];
        let (sharing_mode, index_count) = if ctx.families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, 0)
        } else {
            (vk::SharingMode::CONCURRENT, 2)
        };

        let view_formats = mutable_format_list(format.format);
        let format_list = view_formats.as_ref().map(|list| vk::ImageFormatListCreateInfo {
            s_type: vk::StructureType::IMAGE_FORMAT_LIST_CREATE_INFO,
            view_format_count: list.len() as u32,
            p_view_formats: list.as_ptr(),
            ..Default::default()
        });
        let (flags, p_next) = match &format_list {
            Some(fl) => (
                vk::SwapchainCreateFlagsKHR::MUTABLE_FORMAT,
                fl as *const vk::ImageFormatListCreateInfo as *const std::ffi::c_void,
            ),
            None => (vk::SwapchainCreateFlagsKHR::empty(), std::ptr::null()),
        };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            p_next,
            flags,
            surface: ctx.base.surface,
            min_image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: index_count,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };

        let handle = unsafe { ctx.swapchain_loader.create_swapchain(&info, None) }
            .check("vkCreateSwapchainKHR")?;
        let images = match unsafe { ctx.swapchain_loader.get_swapchain_images(handle) }
            .check("vkGetSwapchainImagesKHR")
        {
            Ok(images) => images,
            Err(e) => {
                unsafe { ctx.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };

        info!(
            "swapchain: {:?} / {:?}, {:?}, {}x{}, images {} (min {}, max {}), mutable formats {:?}",
            format.format,
            format.color_space,
            present_mode,
            extent.width,
            extent.height,
            images.len(),
            caps.min_image_count,
            caps.max_image_count,
            view_formats
        );

        self.chain = Some(Chain {
            handle,
            images,
            format,
            extent,
        });
        Ok(())
    }

    pub fn create_views(&mut self) -> Result<()> {
        let chain = self.chain.as_ref().context("views requested before the swapchain")?;
        debug_assert!(self.views.is_empty());
        for &image in &chain.images {
            let ci = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: chain.format.format,
                components: vk::ComponentMapping::default(),
                subresource_range: subresource(vk::ImageAspectFlags::COLOR, 0, 1),
                ..Default::default()
            };
            let view = unsafe { self.ctx.device.create_image_view(&ci, None) }
                .check("vkCreateImageView")?;
            self.views.push(view);
        }
        Ok(())
    }

    pub fn create_depth(&mut self, up: &UploadContext) -> Result<()> {
        let extent = self.extent().context("depth requested before the swapchain")?;
        let aspect = depth_aspect(self.depth_format);
        let depth = GpuImage::new(
            &self.ctx,
            extent,
            self.depth_format,
            1,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect,
        )?;
        up.submit_once(|d, cmd| unsafe {
            image_barrier(d, cmd, depth.image, subresource(aspect, 0, 1), UNDEFINED_TO_DEPTH)
        })?;
        self.depth = Some(depth);
        Ok(())
    }

    pub fn destroy_views(&mut self) {
        for view in self.views.drain(..) {
            unsafe { self.ctx.device.destroy_image_view(view, None) };
        }
    }

    pub fn destroy_depth(&mut self) {
        self.depth = None;
    }

    pub fn destroy_chain(&mut self) {
        if let Some(chain) = self.chain.take() {
            unsafe { self.ctx.swapchain_loader.destroy_swapchain(chain.handle, None) };
        }
    }

    pub fn image_count(&self) -> usize {
        self.chain.as_ref().map_or(0, |c| c.images.len())
    }

    pub fn images(&self) -> &[vk::Image] {
        self.chain.as_ref().map_or(&[][..], |c| c.images.as_slice())
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn format(&self) -> Option<vk::Format> {
        self.chain.as_ref().map(|c| c.format.format)
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.chain.as_ref().map(|c| c.extent)
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|d| d.view)
    }

    pub fn depth_image(&self) -> Option<vk::Image> {
        self.depth.as_ref().map(|d| d.image)
    }

    pub fn acquire(
        &self,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<SwapchainOutcome<Acquired>, GpuError> {
        let Some(chain) = &self.chain else {
            return Ok(SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate));
        };
        classify_acquire(unsafe {
            self.ctx
                .swapchain_loader
                .acquire_next_image(chain.handle, timeout_ns, signal, vk::Fence::null())
        })
    }

    pub fn present(
        &self,
        image: usize,
        wait: vk::Semaphore,
    ) -> Result<SwapchainOutcome<bool>, GpuError> {
        let Some(chain) = &self.chain else {
            return Ok(SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate));
        };
        let index = image as u32;
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &chain.handle,
            p_image_indices: &index,
            ..Default::default()
        };
        classify_present(unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &info)
        })
    }
}

impl Drop for SwapchainManager {
    // views -> depth -> chain
    fn drop(&mut self) {
        self.destroy_views();
        self.destroy_depth();
        self.destroy_chain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn fresh_start_picks_min_plus_one_and_bgra_srgb() {
        let c = caps(2, 3);
        let count = choose_image_count(&c);
        assert_eq!(count, 3);
        assert!((c.min_image_count..=c.max_image_count).contains(&count));
        let f = choose_surface_format(&[srgb(vk::Format::B8G8R8A8_SRGB)]).unwrap();
        assert_eq!(f.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn image_count_respects_max_and_unbounded() {
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn format_falls_back_to_first() {
        let formats = [srgb(vk::Format::R8G8B8A8_UNORM), srgb(vk::Format::B8G8R8A8_UNORM)];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_follows_hint() {
        use vk::PresentModeKHR as P;
        let all = [P::FIFO, P::MAILBOX, P::IMMEDIATE];
        let hint = |vsync, present| SwapchainHint { vsync, present };
        assert_eq!(choose_present_mode(&all, hint(false, PresentPreference::Fifo)), P::IMMEDIATE);
        assert_eq!(choose_present_mode(&all, hint(true, PresentPreference::Mailbox)), P::MAILBOX);
        assert_eq!(choose_present_mode(&all, hint(true, PresentPreference::Fifo)), P::FIFO);
        assert_eq!(choose_present_mode(&[P::FIFO], hint(true, PresentPreference::Mailbox)), P::FIFO);
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::MAILBOX], hint(false, PresentPreference::Mailbox)),
            P::MAILBOX
        );
    }

    #[test]
    fn extent_uses_current_unless_free() {
        let mut c = caps(2, 3);
        let want = RenderSize {
            width: 10_000,
            height: 0,
        };
        assert_eq!(choose_extent(&c, want).unwrap().width, 800);
        c.current_extent.width = u32::MAX;
        let e = choose_extent(&c, want).unwrap();
        assert_eq!((e.width, e.height), (4096, 1));
    }

    #[test]
    fn zero_current_extent_means_not_ready() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        let want = RenderSize {
            width: 800,
            height: 600,
        };
        assert_eq!(choose_extent(&c, want), None);
        c.current_extent.width = 800;
        assert_eq!(choose_extent(&c, want), None);
        c.current_extent.height = 600;
        assert!(choose_extent(&c, want).is_some());
    }

    #[test]
    fn mutable_list_covers_both_srgb_orders() {
        assert_eq!(
            mutable_format_list(vk::Format::B8G8R8A8_SRGB).unwrap(),
            vec![vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB]
        );
        assert_eq!(
            mutable_format_list(vk::Format::B8G8R8A8_UNORM).unwrap(),
            vec![
                vk::Format::B8G8R8A8_UNORM,
                vk::Format::R8G8B8A8_SRGB,
                vk::Format::B8G8R8A8_SRGB
            ]
        );
        assert!(mutable_format_list(vk::Format::A2B10G10R10_UNORM_PACK32).is_none());
    }

    #[test]
    fn depth_prefers_stencil_formats() {
        assert_eq!(pick_depth_format(|_| true).unwrap(), vk::Format::D32_SFLOAT_S8_UINT);
        assert_eq!(
            pick_depth_format(|f| f == vk::Format::D32_SFLOAT).unwrap(),
            vk::Format::D32_SFLOAT
        );
        assert!(matches!(pick_depth_format(|_| false), Err(GpuError::NoDepthFormat)));
        assert!(depth_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn only_out_of_date_is_retried() {
        assert_eq!(
            classify_acquire(Ok((2, false))).unwrap(),
            SwapchainOutcome::Ready(Acquired {
                image: 2,
                suboptimal: false
            })
        );
        assert_eq!(
            classify_acquire(Ok((0, true))).unwrap(),
            SwapchainOutcome::Ready(Acquired {
                image: 0,
                suboptimal: true
            })
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate)
        );
        for code in [
            vk::Result::TIMEOUT,
            vk::Result::ERROR_SURFACE_LOST_KHR,
            vk::Result::ERROR_DEVICE_LOST,
        ] {
            assert_eq!(classify_acquire(Err(code)).unwrap_err().code(), Some(code));
        }
    }

    #[test]
    fn present_suboptimal_is_ready() {
        assert_eq!(classify_present(Ok(true)).unwrap(), SwapchainOutcome::Ready(true));
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            SwapchainOutcome::Retry(SurfaceInvalid::OutOfDate)
        );
        let err = classify_present(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert!(err.to_string().contains("vkQueuePresentKHR"));
    }
}
