//! Layered configuration: built-in defaults, then an optional TOML file,
//! then environment variables. Command-line flags are applied last by the
//! binary.
//!
//! ```toml
//! output_dir = "strategies"
//!
//! [llm]
//! model = "gpt-4o"
//!
//! [controller.loop]
//! max_iterations = 3
//!
//! [runner]
//! interpreter = "python"
//! timeout_secs = 600
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stratloop_llm::{LlmConfig, PromptServerConfig};
use tracing::debug;

use crate::controller::ControllerConfig;
use crate::domain::{ForgeError, Result, TradingParams};
use crate::runner::RunnerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// When false only the built-in templates are used.
    pub use_prompt_server: bool,
    /// Where `save` writes strategy files.
    pub output_dir: PathBuf,
    /// Where finished sessions are recorded.
    pub session_dir: PathBuf,
    pub llm: LlmConfig,
    pub prompt_server: PromptServerConfig,
    pub controller: ControllerConfig,
    pub runner: RunnerConfig,
    pub params: TradingParams,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            use_prompt_server: true,
            output_dir: PathBuf::from("strategies"),
            session_dir: PathBuf::from(".stratloop/sessions"),
            llm: LlmConfig::default(),
            prompt_server: PromptServerConfig::default(),
            controller: ControllerConfig::default(),
            runner: RunnerConfig::default(),
            params: TradingParams::default(),
        }
    }
}

impl ForgeConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ForgeError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    /// Defaults or `path`, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        base.merge_env()
    }

    /// Apply `OPENAI_*`, `GPT_MODEL`, `PROMPT_*` and `STRATLOOP_*` variables.
    pub fn merge_env(mut self) -> Result<Self> {
        self.llm = self.llm.merge_env();
        self.prompt_server = self.prompt_server.merge_env();

        if let Some(value) = env_value("STRATLOOP_MAX_ITERATIONS") {
            self.controller.loop_config.max_iterations = value.parse().map_err(|_| {
                ForgeError::Config(format!("STRATLOOP_MAX_ITERATIONS is not a number: {value}"))
            })?;
        }
        if let Some(value) = env_value("STRATLOOP_PYTHON") {
            self.runner.interpreter = value;
        }
        if let Some(value) = env_value("STRATLOOP_WORK_DIR") {
            self.runner.work_dir = PathBuf::from(value);
        }
        if let Some(value) = env_value("STRATLOOP_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(value);
        }
        Ok(self)
    }

    /// Serialize back to TOML. Secrets are never written.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ForgeError::Config(e.to_string()))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
