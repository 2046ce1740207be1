//! Orchestrator configuration file.
//!
//! Loaded from the path in `DEPLOY_CONFIG`. A missing file means defaults;
//! a malformed file is a validation error.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DeployError, DeployResult};

fn default_store_path() -> PathBuf {
    PathBuf::from("flotilla.redb")
}

fn default_max_threads() -> usize {
    32
}

fn default_event_buffer() -> usize {
    512
}

fn default_no_progress_bar_stages() -> Vec<String> {
    vec!["Preparing deployment".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Where the state store database lives.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Optional NDJSON sink the event stream is teed into.
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,

    /// Global cap on concurrent instance/VM operations.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Event queue capacity before `in_progress` events get dropped.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Stages the renderer prints line-by-line instead of as a bar.
    #[serde(default = "default_no_progress_bar_stages")]
    pub no_progress_bar_stages: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            event_log_path: None,
            max_threads: default_max_threads(),
            event_buffer: default_event_buffer(),
            no_progress_bar_stages: default_no_progress_bar_stages(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> DeployResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeployError::Config(format!("{}: {e}", path.display())))?;
        let config: OrchestratorConfig = toml::from_str(&text)
            .map_err(|e| DeployError::Config(format!("{}: {e}", path.display())))?;
        if config.max_threads == 0 {
            return Err(DeployError::Config(
                "max_threads must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Load from the `DEPLOY_CONFIG` environment variable, falling back to
    /// defaults when unset.
    pub fn from_env() -> DeployResult<Self> {
        match std::env::var_os("DEPLOY_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}
