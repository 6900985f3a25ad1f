// SPDX-License-Identifier: CEPL-1.0
//! Sampled textures: decode with `image`, stage, transition, optional blit mips.

use crate::barrier::{
    image_barrier, subresource, TRANSFER_DST_TO_SHADER_READ, TRANSFER_DST_TO_SRC,
    TRANSFER_SRC_TO_SHADER_READ, UNDEFINED_TO_TRANSFER_DST,
};
use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use crate::memory::GpuImage;
use crate::upload::UploadContext;
use anyhow::Result;
use ash::vk;
use lantern_render::text::{ATLAS_COLS, ATLAS_ROWS};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Full mip chain length down to 1x1.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// RGBA checkerboard used when a texture file is missing or unreadable.
pub fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    let mut px = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            let c: [u8; 4] = if on {
                [230, 230, 230, 255]
            } else {
                [40, 40, 40, 255]
            };
            px.extend_from_slice(&c);
        }
    }
    px
}

const FALLBACK_GLYPH_PX: u32 = 8;

/// R8 atlas with a hollow box in every printable ASCII cell.
pub fn fallback_atlas() -> (Vec<u8>, u32, u32) {
    let w = ATLAS_COLS * FALLBACK_GLYPH_PX;
    let h = ATLAS_ROWS * FALLBACK_GLYPH_PX;
    let mut px = vec![0u8; (w * h) as usize];
    for byte in 0x21u32..0x7f {
        let cx = (byte % ATLAS_COLS) * FALLBACK_GLYPH_PX;
        let cy = (byte / ATLAS_COLS) * FALLBACK_GLYPH_PX;
        for y in 1..FALLBACK_GLYPH_PX - 1 {
            for x in 1..FALLBACK_GLYPH_PX - 1 {
                let edge = x == 1 || y == 1 || x == FALLBACK_GLYPH_PX - 2 || y == FALLBACK_GLYPH_PX - 2;
                if edge {
                    px[((cy + y) * w + cx + x) as usize] = 255;
                }
            }
        }
    }
    (px, w, h)
}

#[derive(Clone, Copy, Debug)]
pub struct SamplerDesc {
    pub address_mode: vk::SamplerAddressMode,
    pub anisotropy: Option<f32>,
}

pub struct Texture {
    ctx: Arc<DeviceContext>,
    pub image: GpuImage,
    pub sampler: vk::Sampler,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    /// Index of the descriptor set that samples this texture.
    pub descriptor_index: usize,
}

impl Texture {
    /// Decode `path` as RGBA8 sRGB; a checkerboard stands in when it is absent or broken.
    pub fn load(up: &UploadContext, path: Option<&Path>, descriptor_index: usize) -> Result<Self> {
        let decoded = path.and_then(|p| match image::open(p) {
            Ok(img) => Some((img.to_rgba8(), p)),
            Err(e) => {
                warn!("texture {}: {e}; using checkerboard", p.display());
                None
            }
        });
        let (pixels, w, h) = match decoded {
            Some((rgba, p)) => {
                let (w, h) = rgba.dimensions();
                info!("texture {}: {}x{}", p.display(), w, h);
                (rgba.into_raw(), w, h)
            }
            None => (checkerboard(64, 8), 64, 64),
        };

        let anisotropy = up.context().max_anisotropy();
        Texture::from_pixels(
            up,
            &pixels,
            w,
            h,
            vk::Format::R8G8B8A8_SRGB,
            true,
            SamplerDesc {
                address_mode: vk::SamplerAddressMode::REPEAT,
                anisotropy: Some(anisotropy),
            },
            descriptor_index,
        )
    }

    /// Single-channel glyph atlas, 16x16 ASCII cells, no mips.
    pub fn load_atlas(up: &UploadContext, path: Option<&Path>) -> Result<Self> {
        let decoded = path.and_then(|p| match image::open(p) {
            Ok(img) => Some(img.to_luma8()),
            Err(e) => {
                warn!("font atlas {}: {e}; using built-in boxes", p.display());
                None
            }
        });
        let (pixels, w, h) = match decoded {
            Some(luma) => {
                let (w, h) = luma.dimensions();
                (luma.into_raw(), w, h)
            }
            None => fallback_atlas(),
        };
        Texture::from_pixels(
            up,
            &pixels,
            w,
            h,
            vk::Format::R8_UNORM,
            false,
            SamplerDesc {
                address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
                anisotropy: None,
            },
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_pixels(
        up: &UploadContext,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
        mipmapped: bool,
        sampler: SamplerDesc,
        descriptor_index: usize,
    ) -> Result<Self> {
        let ctx = up.context().clone();
        let blit_ok = ctx
            .format_features(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR);
        let levels = if mipmapped && blit_ok {
            mip_levels(width, height)
        } else {
            if mipmapped {
                warn!("{format:?} cannot be linearly blitted; skipping mip generation");
            }
            1
        };

        let staging = up.stage(pixels)?;
        let extent = vk::Extent2D { width, height };
        let image = GpuImage::new(
            &ctx,
            extent,
            format,
            levels,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        up.submit_once(|d, cmd| unsafe {
            record_upload(d, cmd, staging.buffer, image.image, extent, levels)
        })?;
        drop(staging);

        let sampler = create_sampler(&ctx, sampler, levels)?;
        Ok(Texture {
            ctx,
            image,
            sampler,
            width,
            height,
            mip_levels: levels,
            descriptor_index,
        })
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_sampler(self.sampler, None) };
    }
}

/// UNDEFINED -> TRANSFER_DST, copy level 0, blit down the chain, end in SHADER_READ_ONLY.
unsafe fn record_upload(
    d: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent2D,
    levels: u32,
) {
    let color = vk::ImageAspectFlags::COLOR;
    image_barrier(d, cmd, image, subresource(color, 0, levels), UNDEFINED_TO_TRANSFER_DST);

    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: color,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    };
    d.cmd_copy_buffer_to_image(
        cmd,
        src,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        std::slice::from_ref(&region),
    );

    let (mut w, mut h) = (extent.width as i32, extent.height as i32);
    for level in 1..levels {
        image_barrier(d, cmd, image, subresource(color, level - 1, 1), TRANSFER_DST_TO_SRC);
        let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: w, y: h, z: 1 }],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [vk::Offset3D::default(), vk::Offset3D { x: nw, y: nh, z: 1 }],
        };
        d.cmd_blit_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&blit),
            vk::Filter::LINEAR,
        );
        image_barrier(d, cmd, image, subresource(color, level - 1, 1), TRANSFER_SRC_TO_SHADER_READ);
        (w, h) = (nw, nh);
    }
    // last level was only ever written
    image_barrier(d, cmd, image, subresource(color, levels - 1, 1), TRANSFER_DST_TO_SHADER_READ);
}

fn create_sampler(ctx: &DeviceContext, desc: SamplerDesc, levels: u32) -> Result<vk::Sampler, GpuError> {
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: desc.address_mode,
        address_mode_v: desc.address_mode,
        address_mode_w: desc.address_mode,
        mip_lod_bias: 0.0,
        anisotropy_enable: desc.anisotropy.is_some() as vk::Bool32,
        max_anisotropy: desc.anisotropy.unwrap_or(1.0),
        compare_op: vk::CompareOp::NEVER,
        min_lod: 0.0,
        max_lod: levels as f32,
        border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
        ..Default::default()
    };
    unsafe { ctx.device.create_sampler(&ci, None) }.check("vkCreateSampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_lengths() {
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(256, 256), 9);
        assert_eq!(mip_levels(512, 64), 10);
        assert_eq!(mip_levels(300, 20), 9);
        assert_eq!(mip_levels(0, 0), 1);
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let px = checkerboard(4, 2);
        assert_eq!(px.len(), 4 * 4 * 4);
        assert_eq!(&px[0..4], &[230, 230, 230, 255]);
        // (2, 0) is the next cell over
        assert_eq!(&px[8..12], &[40, 40, 40, 255]);
    }

    #[test]
    fn fallback_atlas_marks_printable_cells_only() {
        let (px, w, h) = fallback_atlas();
        assert_eq!((w, h), (128, 128));
        let lit = |byte: u32| {
            let cx = (byte % 16) * 8;
            let cy = (byte / 16) * 8;
            (0..8).any(|y| (0..8).any(|x| px[((cy + y) * w + cx + x) as usize] > 0))
        };
        assert!(lit(b'A' as u32));
        assert!(!lit(b' ' as u32));
        assert!(!lit(0x7f));
    }
}
