// SPDX-License-Identifier: CEPL-1.0
//! Shader loading, the on-disk pipeline cache and graphics pipeline creation.

use crate::device::DeviceContext;
use crate::error::{GpuError, VkResultExt};
use anyhow::Result;
use ash::util::read_spv;
use ash::vk;
use lantern_render::Vertex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderPaths {
    pub mesh_vert: PathBuf,
    pub mesh_frag: PathBuf,
    pub text_vert: PathBuf,
    pub text_frag: PathBuf,
}

impl ShaderPaths {
    pub fn in_dir(dir: &Path) -> Self {
        ShaderPaths {
            mesh_vert: dir.join("mesh.vert.spv"),
            mesh_frag: dir.join("mesh.frag.spv"),
            text_vert: dir.join("text.vert.spv"),
            text_frag: dir.join("text.frag.spv"),
        }
    }

    /// `configured` directory, else the build's compiled output.
    pub fn resolve(configured: Option<&Path>) -> Self {
        ShaderPaths::in_dir(configured.unwrap_or(Path::new(env!("OUT_DIR"))))
    }
}

/// Read a SPIR-V blob into words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>, GpuError> {
    let shader_err = |source| GpuError::Shader {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(shader_err)?;
    read_spv(&mut file).map_err(shader_err)
}

fn hex_bytes(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{:02x}", x);
    }
    s
}

/// Cache file name is keyed by vendor / device / driver / cache UUID so a
/// driver update never feeds a stale blob back.
pub fn pipeline_cache_path(dir: Option<&Path>, props: &vk::PhysicalDeviceProperties) -> PathBuf {
    let name = format!(
        "lantern_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
        props.vendor_id,
        props.device_id,
        props.driver_version,
        hex_bytes(&props.pipeline_cache_uuid)
    );
    dir.unwrap_or(Path::new(".")).join(name)
}

pub struct PipelineCache {
    ctx: Arc<DeviceContext>,
    pub cache: vk::PipelineCache,
    path: PathBuf,
}

impl PipelineCache {
    pub fn load(ctx: &Arc<DeviceContext>, dir: Option<&Path>) -> Result<Self, GpuError> {
        let path = pipeline_cache_path(dir, &ctx.props);
        let data = fs::read(&path).unwrap_or_default();
        let create = |bytes: &[u8]| {
            let ci = vk::PipelineCacheCreateInfo {
                s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
                initial_data_size: bytes.len(),
                p_initial_data: bytes.as_ptr() as *const std::ffi::c_void,
                ..Default::default()
            };
            unsafe { ctx.device.create_pipeline_cache(&ci, None) }.check("vkCreatePipelineCache")
        };
        let cache = match create(&data[..]) {
            Ok(c) => c,
            Err(e) if !data.is_empty() => {
                warn!("pipeline cache {} rejected ({e}); starting empty", path.display());
                create(&[][..])?
            }
            Err(e) => return Err(e),
        };
        info!("pipeline cache {} ({} bytes)", path.display(), data.len());
        Ok(PipelineCache {
            ctx: ctx.clone(),
            cache,
            path,
        })
    }

    pub fn save(&self) -> Result<()> {
        let bytes = unsafe { self.ctx.device.get_pipeline_cache_data(self.cache) }
            .check("vkGetPipelineCacheData")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &bytes)?;
        debug!("pipeline cache saved: {} bytes", bytes.len());
        Ok(())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!("pipeline cache not saved: {e:#}");
        }
        unsafe { self.ctx.device.destroy_pipeline_cache(self.cache, None) };
    }
}

/// Everything that varies between the scene and overlay pipelines.
pub struct GraphicsPipelineDesc<'a> {
    pub vert: &'a [u32],
    pub frag: &'a [u32],
    pub bindings: &'a [vk::VertexInputBindingDescription],
    pub attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub layout: vk::PipelineLayout,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    /// `Some`: baked viewport/scissor. `None`: set dynamically at record time.
    pub extent: Option<vk::Extent2D>,
    pub cull_mode: vk::CullModeFlags,
    pub alpha_blend: bool,
}

unsafe fn shader_module(d: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule, GpuError> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: code.len() * 4,
        p_code: code.as_ptr(),
        ..Default::default()
    };
    d.create_shader_module(&ci, None).check("vkCreateShaderModule")
}

// STRICT: color_format must match the live swapchain; rebuild with it.
pub unsafe fn create_graphics_pipeline(
    d: &ash::Device,
    cache: vk::PipelineCache,
    desc: &GraphicsPipelineDesc<'_>,
) -> Result<vk::Pipeline> {
    let vs = shader_module(d, desc.vert)?;
    let fs = match shader_module(d, desc.frag) {
        Ok(m) => m,
        Err(e) => {
            d.destroy_shader_module(vs, None);
            return Err(e.into());
        }
    };
    let entry = c"main";

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: desc.bindings.len() as u32,
        p_vertex_binding_descriptions: desc.bindings.as_ptr(),
        vertex_attribute_description_count: desc.attributes.len() as u32,
        p_vertex_attribute_descriptions: desc.attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: desc.topology,
        ..Default::default()
    };

    // --- Viewport: baked from the swapchain extent, or dynamic ---
    let (viewport, scissor) = match desc.extent {
        Some(extent) => (
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        ),
        None => (vk::Viewport::default(), vk::Rect2D::default()),
    };
    let dynamic = desc.extent.is_none();
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        p_viewports: if dynamic { std::ptr::null() } else { &viewport },
        scissor_count: 1,
        p_scissors: if dynamic { std::ptr::null() } else { &scissor },
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: if dynamic { dyn_states.len() as u32 } else { 0 },
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };

    // projection flips Y, so outward faces stay counter-clockwise
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: desc.cull_mode,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_on = desc.depth_format.is_some() as vk::Bool32;
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: depth_on,
        depth_write_enable: depth_on,
        depth_compare_op: vk::CompareOp::LESS,
        ..Default::default()
    };
    let blend_att = vk::PipelineColorBlendAttachmentState {
        blend_enable: desc.alpha_blend as vk::Bool32,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &blend_att,
        ..Default::default()
    };

    let rendering = vk::PipelineRenderingCreateInfo {
        s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
        color_attachment_count: 1,
        p_color_attachment_formats: &desc.color_format,
        depth_attachment_format: desc.depth_format.unwrap_or(vk::Format::UNDEFINED),
        ..Default::default()
    };

    let info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        p_next: (&rendering as *const vk::PipelineRenderingCreateInfo) as *const _,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout: desc.layout,
        ..Default::default()
    };

    let result = d.create_graphics_pipelines(cache, std::slice::from_ref(&info), None);
    d.destroy_shader_module(vs, None);
    d.destroy_shader_module(fs, None);
    match result {
        Ok(p) => Ok(p[0]),
        Err((_, code)) => Err(GpuError::Call {
            call: "vkCreateGraphicsPipelines",
            code,
        }
        .into()),
    }
}

pub fn mesh_vertex_attributes() -> [vk::VertexInputAttributeDescription; 4] {
    let attr = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };
    [
        attr(0, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, position)),
        attr(1, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, normal)),
        attr(2, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, color)),
        attr(3, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(Vertex, uv)),
    ]
}

/// Scene pipeline. The layout lives as long as the renderer; the pipeline
/// itself is rebuilt against each swapchain.
pub struct MeshPipeline {
    ctx: Arc<DeviceContext>,
    pub layout: vk::PipelineLayout,
    pipeline: Option<vk::Pipeline>,
    vert: Vec<u32>,
    frag: Vec<u32>,
}

impl MeshPipeline {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        set_layout: vk::DescriptorSetLayout,
        shaders: &ShaderPaths,
    ) -> Result<Self> {
        let vert = load_spirv(&shaders.mesh_vert)?;
        let frag = load_spirv(&shaders.mesh_frag)?;
        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };
        let layout = unsafe { ctx.device.create_pipeline_layout(&layout_info, None) }
            .check("vkCreatePipelineLayout")?;
        Ok(MeshPipeline {
            ctx: ctx.clone(),
            layout,
            pipeline: None,
            vert,
            frag,
        })
    }

    pub fn create(
        &mut self,
        cache: vk::PipelineCache,
        color_format: vk::Format,
        depth_format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.destroy();
        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = mesh_vertex_attributes();
        let desc = GraphicsPipelineDesc {
            vert: &self.vert,
            frag: &self.frag,
            bindings: &bindings,
            attributes: &attributes,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            layout: self.layout,
            color_format,
            depth_format: Some(depth_format),
            extent: Some(extent),
            cull_mode: vk::CullModeFlags::BACK,
            alpha_blend: false,
        };
        let pipeline = unsafe { create_graphics_pipeline(&self.ctx.device, cache, &desc)? };
        debug!(
            "mesh pipeline for {:?} {}x{}",
            color_format, extent.width, extent.height
        );
        self.pipeline = Some(pipeline);
        Ok(())
    }

    pub fn destroy(&mut self) {
        if let Some(p) = self.pipeline.take() {
            unsafe { self.ctx.device.destroy_pipeline(p, None) };
        }
    }

    pub fn handle(&self) -> Option<vk::Pipeline> {
        self.pipeline
    }
}

impl Drop for MeshPipeline {
    fn drop(&mut self) {
        self.destroy();
        unsafe { self.ctx.device.destroy_pipeline_layout(self.layout, None) };
    }
}
