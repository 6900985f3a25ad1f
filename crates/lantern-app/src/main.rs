// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::Parser;
use glam::{Mat4, Vec3};
use lantern_core::config::{LanternConfig, VsyncMode};
use lantern_core::{init_tracing, FrameClock};
use lantern_math::{orbit_y, Camera};
use lantern_platform::winit::keyboard::KeyCode;
use lantern_platform::WindowHost;
use lantern_render::mesh::load_obj;
use lantern_render::text::TextAlign;
use lantern_render::{
    DrawableSurface, FrameOutcome, MeshData, ModelDesc, PresentPreference, RenderOptions,
    Renderer, SceneUniforms,
};
use lantern_render_vk::VkRenderer;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Degrees per millisecond while E is held.
const LIGHT_ORBIT_SPEED: f32 = 0.09;
const LIGHT_MODEL_SCALE: f32 = 0.2;
/// Scene model that C lifts.
const RAISED_MODEL: usize = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(long, default_value = "lantern.toml")]
    config: PathBuf,
    /// Window width, overrides the config
    #[arg(long)]
    width: Option<u32>,
    /// Window height, overrides the config
    #[arg(long)]
    height: Option<u32>,
    /// Present without vsync
    #[arg(long)]
    no_vsync: bool,
}

fn render_options(cfg: &LanternConfig, args: &Args) -> RenderOptions {
    RenderOptions {
        clear_color: cfg.render.clear_color,
        vsync: cfg.render.vsync && !args.no_vsync,
        present: match cfg.render.vsync_mode {
            VsyncMode::Fifo => PresentPreference::Fifo,
            VsyncMode::Mailbox => PresentPreference::Mailbox,
        },
        validation: cfg.render.validation,
        shader_dir: cfg.render.shader_dir.clone(),
        pipeline_cache_dir: cfg.render.pipeline_cache_dir.clone(),
        overlay_enabled: cfg.overlay.enabled,
        font_atlas: cfg.overlay.font_atlas.clone(),
        glyph_px: cfg.overlay.glyph_px,
    }
}

/// Scene models and their world positions. Unreadable meshes become cubes;
/// an empty scene gets one cube at the origin.
fn load_scene(cfg: &LanternConfig) -> (Vec<ModelDesc>, Vec<Vec3>) {
    if cfg.scene.models.is_empty() {
        info!("no models configured, drawing a cube");
        let cube = ModelDesc {
            mesh: MeshData::cube(),
            texture: None,
        };
        return (vec![cube], vec![Vec3::ZERO]);
    }
    cfg.scene
        .models
        .iter()
        .map(|m| {
            let mesh = load_obj(&m.mesh).unwrap_or_else(|e| {
                warn!("{e:#}; using a cube");
                MeshData::cube()
            });
            let desc = ModelDesc {
                mesh,
                texture: m.texture.clone(),
            };
            (desc, Vec3::from_array(m.position))
        })
        .unzip()
}

/// Moves the light with E (orbit) and Z / X (up / down).
fn update_light(light: Vec3, host: &WindowHost, dt_ms: f32, speed: f32) -> Vec3 {
    let input = host.input();
    let mut light = light;
    if input.is_held(KeyCode::KeyE) {
        light = orbit_y(light, dt_ms * LIGHT_ORBIT_SPEED);
    }
    if input.is_held(KeyCode::KeyZ) {
        light.y += dt_ms * speed;
    }
    if input.is_held(KeyCode::KeyX) {
        light.y -= dt_ms * speed;
    }
    light
}

/// Lifts one model along Y; a scene with fewer models is left alone.
fn raise_model(positions: &mut [Vec3], index: usize, dy: f32) {
    if let Some(p) = positions.get_mut(index) {
        p.y += dy;
    }
}

fn model_transforms(positions: &[Vec3], light_model: Option<usize>, light: Vec3) -> Vec<Mat4> {
    positions
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            if Some(i) == light_model {
                Mat4::from_translation(light) * Mat4::from_scale(Vec3::splat(LIGHT_MODEL_SCALE))
            } else {
                Mat4::from_translation(p)
            }
        })
        .collect()
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = LanternConfig::load_or_default(&args.config);
    let width = args.width.unwrap_or(cfg.window.width);
    let height = args.height.unwrap_or(cfg.window.height);

    // declared before the renderer so the window outlives its surface
    let mut host = WindowHost::new(&cfg.window.title, width, height)?;
    let (models, mut positions) = load_scene(&cfg);
    let light_model = cfg.scene.light_model.filter(|&i| {
        let ok = i < positions.len();
        if !ok {
            warn!("light_model {i} is out of range; ignoring");
        }
        ok
    });

    let options = render_options(&cfg, &args);
    let mut renderer = {
        let window = host.window()?;
        VkRenderer::new(window, window, host.drawable_size(), &options, &models)
            .context("vk init")?
    };
    info!("vsync = {}", options.vsync);

    let mut camera = Camera::new(Vec3::from_array(cfg.camera.position), cfg.camera.fov_deg);
    let mut light = Vec3::from_array(cfg.scene.light_position);
    let mut clock = FrameClock::new();

    while host.pump() {
        if let Some(fps) = clock.tick() {
            debug!("fps ~ {fps:.0}");
        }
        let dt = clock.delta_ms();

        let keys = host.input().move_keys();
        camera.apply_keys(keys, dt, cfg.camera.move_speed, cfg.camera.look_speed);
        let (dx, dy) = host.input_mut().take_drag();
        camera.apply_drag(dx, dy, cfg.camera.mouse_sensitivity);
        light = update_light(light, &host, dt, cfg.camera.move_speed);
        if host.input().is_held(KeyCode::KeyC) {
            raise_model(&mut positions, RAISED_MODEL, dt * cfg.camera.move_speed);
        }

        let size = host.drawable_size();
        let uniforms = SceneUniforms {
            view: camera.view(),
            proj: camera.projection(size.aspect()),
            camera_pos: camera.position,
            light_pos: light,
            model_transforms: model_transforms(&positions, light_model, light),
        };

        renderer.begin_text_update();
        let line = cfg.overlay.glyph_px + 4.0;
        renderer.add_text(&format!("FPS {:.0}", clock.fps()), 8.0, 8.0, TextAlign::Left);
        renderer.add_text(
            &format!("frame {:.2} ms", dt),
            8.0,
            8.0 + line,
            TextAlign::Left,
        );
        let p = camera.position;
        renderer.add_text(
            &format!("cam {:.2} {:.2} {:.2}", p.x, p.y, p.z),
            8.0,
            8.0 + 2.0 * line,
            TextAlign::Left,
        );
        renderer.end_text_update();

        match renderer.render(&mut host, &uniforms)? {
            FrameOutcome::Presented { .. } => {}
            FrameOutcome::Rebuilt(reason) => debug!("frame skipped, swapchain rebuilt ({reason:?})"),
            FrameOutcome::Closed => break,
        }
    }

    info!(
        "exiting after {} swapchain rebuilds",
        renderer.frame_loop().rebuild_count()
    );
    Ok(())
}
