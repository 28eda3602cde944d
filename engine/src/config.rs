use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::CodecLimits;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub ticks: TickConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// PEM certificate chain; when absent a self-signed certificate is
    /// generated at startup.
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickConfig {
    pub ticks_per_second: u32,
    pub game_fps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_frame_payload_bytes: usize,
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let parsed = toml::from_str::<Self>(&content)?;
        Ok(parsed)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.ticks.ticks_per_second.max(1)))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.ticks.game_fps.max(1)))
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_frame_payload: self.limits.max_frame_payload_bytes,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 10,
            game_fps: 60,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_payload_bytes: 64 * 1024,
        }
    }
}
