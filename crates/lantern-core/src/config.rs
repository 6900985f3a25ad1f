// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LanternConfig {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub camera: CameraCfg,
    #[serde(default)]
    pub scene: SceneCfg,
    #[serde(default)]
    pub overlay: OverlayCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowCfg {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default = "default_true")]
    pub vsync: bool,
    #[serde(default)]
    pub vsync_mode: VsyncMode,
    /// Enable the Khronos validation layer. Debug builds only.
    #[serde(default = "default_true")]
    pub validation: bool,
    /// Directory holding `mesh.vert.spv` etc. `None` uses the build output.
    #[serde(default)]
    pub shader_dir: Option<PathBuf>,
    /// Directory for the device-keyed pipeline cache blob. `None` uses the working directory.
    #[serde(default)]
    pub pipeline_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraCfg {
    #[serde(default = "default_fov")]
    pub fov_deg: f32,
    /// World units per millisecond.
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,
    /// Radians per millisecond while an arrow key is held.
    #[serde(default = "default_look_speed")]
    pub look_speed: f32,
    /// Radians per pixel of mouse drag.
    #[serde(default = "default_mouse_sensitivity")]
    pub mouse_sensitivity: f32,
    #[serde(default = "default_camera_position")]
    pub position: [f32; 3],
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelCfg {
    pub mesh: PathBuf,
    #[serde(default)]
    pub texture: Option<PathBuf>,
    #[serde(default)]
    pub position: [f32; 3],
}

#[derive(Debug, Deserialize, Clone)]
pub struct SceneCfg {
    #[serde(default)]
    pub models: Vec<ModelCfg>,
    /// Index into `models` of the model that stands in for the light.
    #[serde(default)]
    pub light_model: Option<usize>,
    #[serde(default = "default_light")]
    pub light_position: [f32; 3],
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub font_atlas: Option<PathBuf>,
    /// Glyph cell size in pixels.
    #[serde(default = "default_glyph_px")]
    pub glyph_px: f32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            validation: true,
            shader_dir: None,
            pipeline_cache_dir: None,
        }
    }
}

impl Default for CameraCfg {
    fn default() -> Self {
        CameraCfg {
            fov_deg: default_fov(),
            move_speed: default_move_speed(),
            look_speed: default_look_speed(),
            mouse_sensitivity: default_mouse_sensitivity(),
            position: default_camera_position(),
        }
    }
}

impl Default for SceneCfg {
    fn default() -> Self {
        SceneCfg {
            models: Vec::new(),
            light_model: None,
            light_position: default_light(),
        }
    }
}

impl Default for OverlayCfg {
    fn default() -> Self {
        OverlayCfg {
            enabled: true,
            font_atlas: None,
            glyph_px: default_glyph_px(),
        }
    }
}

fn default_title() -> String {
    "lantern".to_owned()
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_true() -> bool {
    true
}
fn default_fov() -> f32 {
    45.0
}
fn default_move_speed() -> f32 {
    0.005
}
fn default_look_speed() -> f32 {
    0.002
}
fn default_mouse_sensitivity() -> f32 {
    0.01
}
fn default_camera_position() -> [f32; 3] {
    [0.0, 0.0, 2.0]
}
fn default_light() -> [f32; 3] {
    [3.0, 3.0, 3.0]
}
fn default_glyph_px() -> f32 {
    16.0
}

impl LanternConfig {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    /// Missing file means defaults; a broken file is reported and also falls back.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                info!("no {} found, using defaults", path.display());
                LanternConfig::default()
            }
            Err(e) => {
                warn!("{e}; using defaults");
                LanternConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = LanternConfig::parse(Path::new("lantern.toml"), "").unwrap();
        assert_eq!(cfg.window.width, 800);
        assert_eq!(cfg.window.height, 600);
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Mailbox);
        assert!(cfg.scene.models.is_empty());
        assert_eq!(cfg.camera.position, [0.0, 0.0, 2.0]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let text = r#"
            [render]
            vsync_mode = "fifo"
            clear_color = [0.1, 0.2, 0.3, 1.0]

            [[scene.models]]
            mesh = "models/cube.obj"
            texture = "textures/crate.png"
            position = [1.0, 0.0, 0.0]

            [[scene.models]]
            mesh = "models/sphere.obj"
        "#;
        let cfg = LanternConfig::parse(Path::new("lantern.toml"), text).unwrap();
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Fifo);
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(cfg.scene.models.len(), 2);
        assert_eq!(cfg.scene.models[0].position, [1.0, 0.0, 0.0]);
        assert_eq!(cfg.scene.models[1].texture, None);
        assert_eq!(cfg.scene.models[1].position, [0.0, 0.0, 0.0]);
        assert_eq!(cfg.window.title, "lantern");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let err = LanternConfig::parse(Path::new("bad.toml"), "[render\nvsync = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = LanternConfig::load_or_default(Path::new("definitely/not/here.toml"));
        assert_eq!(cfg.window.width, 800);
    }
}
