//! Server configuration loading

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use wisp_core::gateway::DEFAULT_SAMPLE_SIZE;

/// Main configuration for the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Neighbors returned per scout
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Frames larger than this are answered with an error and dropped.
    /// Frames over `HARD_LIMIT_FACTOR` times this close the socket
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KiB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file, or defaults if none is given or
    /// the file does not exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        if !path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ServerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }
}
