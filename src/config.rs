//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Code generation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// Native code disabled, closure-threaded code only
    Off,
    /// Native code; falls back to threaded code where unsupported
    On,
    /// Native code if supported on this platform
    #[default]
    Auto,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    pub trace_jit: bool,
    /// Operand stack over-allocation factor applied to a body's max stack.
    pub stack_slack: usize,
    /// Install the host display/event/text stub classes.
    pub host_classes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            trace_jit: false,
            stack_slack: 10,
            host_classes: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
