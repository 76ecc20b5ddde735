// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tandem_vk::PoolSizes;
use tracing::warn;

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    /// Sleep between two frames of one worker. 0 draws back to back and
    /// lets FIFO pacing do the throttling.
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_validation")]
    pub validation: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            frame_interval_ms: default_frame_interval(),
            validation: default_validation(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WindowCfg {
    #[serde(default = "default_window_count")]
    pub count: usize,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            count: default_window_count(),
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PoolCfg {
    #[serde(default = "default_descriptors")]
    pub uniform_buffers: u32,
    #[serde(default = "default_descriptors")]
    pub combined_image_samplers: u32,
    #[serde(default = "default_descriptors")]
    pub storage_buffers: u32,
    #[serde(default = "default_max_sets")]
    pub max_sets: u32,
}

impl Default for PoolCfg {
    fn default() -> Self {
        PoolCfg {
            uniform_buffers: default_descriptors(),
            combined_image_samplers: default_descriptors(),
            storage_buffers: default_descriptors(),
            max_sets: default_max_sets(),
        }
    }
}

impl From<PoolCfg> for PoolSizes {
    fn from(cfg: PoolCfg) -> Self {
        PoolSizes {
            uniform_buffers: cfg.uniform_buffers,
            combined_image_samplers: cfg.combined_image_samplers,
            storage_buffers: cfg.storage_buffers,
            max_sets: cfg.max_sets,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineCacheCfg {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub windows: WindowCfg,
    #[serde(default)]
    pub pools: PoolCfg,
    #[serde(default)]
    pub pipeline_cache: PipelineCacheCfg,
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_frame_interval() -> u64 {
    16
}
fn default_validation() -> bool {
    cfg!(debug_assertions)
}
fn default_window_count() -> usize {
    2
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_descriptors() -> u32 {
    128
}
fn default_max_sets() -> u32 {
    256
}

/// Reads `path`. A missing file gives the defaults, a malformed one is
/// reported and also gives the defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg.windows.count, 2);
        assert_eq!(cfg.render.frame_interval_ms, 16);
        assert_eq!(cfg.render.clear_color, default_clear());
        assert!(cfg.pipeline_cache.path.is_none());
        assert_eq!(PoolSizes::from(cfg.pools), PoolSizes::default());
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let cfg = parse_cfg(
            r#"
            [render]
            clear_color = [1.0, 0.0, 0.0, 1.0]

            [windows]
            count = 3

            [pools]
            max_sets = 32

            [pipeline_cache]
            path = "cache.bin"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(cfg.render.frame_interval_ms, 16);
        assert_eq!(cfg.windows.count, 3);
        assert_eq!(cfg.windows.width, 800);
        assert_eq!(cfg.pools.max_sets, 32);
        assert_eq!(cfg.pools.uniform_buffers, 128);
        assert_eq!(cfg.pipeline_cache.path, Some(PathBuf::from("cache.bin")));
    }

    #[test]
    fn malformed_file_falls_back() {
        assert!(parse_cfg("[render\nclear_color = 3").is_err());
        let cfg = load_cfg(Path::new("definitely/not/here.toml"));
        assert_eq!(cfg.windows.count, 2);
    }
}
