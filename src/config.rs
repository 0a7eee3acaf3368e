//! Agent configuration.
//!
//! Loaded from a JSON file passed on the command line. A few helper-tool
//! settings can be overridden through the environment:
//! `JVM_AGENT_HELPER_TIMEOUT` and `JVM_AGENT_HEAP_DUMP_DIR`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::properties::{IpcProperties, ProviderRegistry};

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Endpoint the agent listens on.
    pub endpoint: EndpointName,

    /// IPC properties file selecting the transport.
    pub properties_file: PathBuf,

    /// Settings for external diagnostic tools.
    #[serde(default)]
    pub helper: HelperConfig,
}

/// How the agent runs JVM diagnostic tools.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperConfig {
    /// `jcmd` executable, looked up on `PATH` when not absolute.
    #[serde(default = "default_jcmd")]
    pub jcmd: PathBuf,

    /// Maximum runtime of a single tool invocation.
    #[serde(default = "default_helper_timeout")]
    pub timeout_seconds: u64,

    /// Where heap dumps are written.
    #[serde(default = "default_heap_dump_dir")]
    pub heap_dump_dir: PathBuf,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            jcmd: default_jcmd(),
            timeout_seconds: default_helper_timeout(),
            heap_dump_dir: default_heap_dump_dir(),
        }
    }
}

fn default_jcmd() -> PathBuf {
    "jcmd".into()
}

const fn default_helper_timeout() -> u64 {
    30
}

fn default_heap_dump_dir() -> PathBuf {
    std::env::temp_dir()
}

impl AgentConfig {
    /// Load configuration from `path` and apply environment overrides.
    ///
    /// A relative `properties_file` is resolved against the directory of the
    /// configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if config.properties_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.properties_file = dir.join(&config.properties_file);
            }
        }
        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            endpoint = %config.endpoint,
            properties = %config.properties_file.display(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(timeout) = lookup("JVM_AGENT_HELPER_TIMEOUT").and_then(|v| v.parse().ok()) {
            debug!(timeout, "Helper timeout overridden from environment");
            self.helper.timeout_seconds = timeout;
        }
        if let Some(dir) = lookup("JVM_AGENT_HEAP_DUMP_DIR").filter(|v| !v.is_empty()) {
            debug!(dir = %dir, "Heap dump directory overridden from environment");
            self.helper.heap_dump_dir = dir.into();
        }
    }

    /// Resolve the transport this agent should listen on.
    pub fn ipc_properties(&self, providers: &ProviderRegistry) -> Result<IpcProperties, IpcError> {
        providers.load(&self.properties_file)
    }
}
