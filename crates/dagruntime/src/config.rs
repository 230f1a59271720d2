use dagcore::FlowError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrency cap inside a parallel group; 0 means unlimited
    pub max_parallel_steps: usize,
    pub event_buffer_size: usize,
    /// Fallback filter for `init_tracing` when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 0,
            event_buffer_size: 1000,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, FlowError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| FlowError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.event_buffer_size == 0 {
            return Err(FlowError::Config("event_buffer_size must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Effective concurrency for a group of `members` steps
    pub(crate) fn group_concurrency(&self, members: usize) -> usize {
        match self.max_parallel_steps {
            0 => members.max(1),
            cap => cap.min(members.max(1)),
        }
    }
}
