use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::EngineConfig;

pub const DEFAULT_CONFIG_FILE: &str = "canvasflow.yaml";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_MAX_BODY: usize = 1_048_576;
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Configuration loaded from `canvasflow.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CanvasflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Root of the JSON repository and checkpoint files.
    pub data_dir: Option<String>,
    pub max_body: Option<usize>,
    pub max_concurrent_nodes: Option<usize>,
    pub batch_concurrency: Option<usize>,
    pub stream_buffer: Option<usize>,
    pub run_timeout_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub debug_url_template: Option<String>,
    /// Checkpoints go to Redis when set (requires the `redis` feature).
    pub redis_url: Option<String>,
}

impl CanvasflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `canvasflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yml::from_str(contents)?)
    }

    pub fn data_dir(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.data_dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer.unwrap_or(DEFAULT_STREAM_BUFFER)
    }

    /// Engine settings: file values override the `CANVASFLOW_*` environment.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(n) = self.max_concurrent_nodes {
            config.max_concurrent_nodes = n;
        }
        if let Some(n) = self.batch_concurrency {
            config.default_batch_concurrency = n;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff_ms = ms;
        }
        if self.run_timeout_ms.is_some() {
            config.run_timeout_ms = self.run_timeout_ms;
        }
        if let Some(t) = &self.debug_url_template {
            config.debug_url_template = t.clone();
        }
        config
    }
}
