use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Tunables shared by every stage built from one [`crate::EngineHandle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound, in bytes, of packet data read from a container per pull.
    pub demux_chunk_size: usize,
    /// Maximum number of units outstanding in a hardware codec queue.
    pub hw_queue_threshold: usize,
    /// Ask the hardware codec service before the software engine.
    pub prefer_hardware: bool,
    pub default_mux_format: String,
    pub default_video_codec: String,
    pub default_audio_codec: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            demux_chunk_size: 65536,
            hw_queue_threshold: 3,
            prefer_hardware: true,
            default_mux_format: "matroska".to_string(),
            default_video_codec: "vp9".to_string(),
            default_audio_codec: "opus".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Parses a (possibly partial) JSON override; missing keys keep their defaults.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.hw_queue_threshold == 0 {
            anyhow::bail!("hw_queue_threshold must be at least 1");
        }
        if config.demux_chunk_size == 0 {
            anyhow::bail!("demux_chunk_size must be at least 1");
        }
        Ok(config)
    }
}

static CONFIG: LazyLock<PipelineConfig> = LazyLock::new(|| {
    match std::env::var("AVCHAIN_CONFIG") {
        Ok(json) => PipelineConfig::from_json(&json).unwrap_or_else(|e| {
            log::warn!("ignoring AVCHAIN_CONFIG: {:#}", e);
            PipelineConfig::default()
        }),
        Err(_) => PipelineConfig::default(),
    }
});

/// Process-wide defaults, optionally overridden by the `AVCHAIN_CONFIG` JSON variable.
pub fn config() -> &'static PipelineConfig {
    &CONFIG
}
