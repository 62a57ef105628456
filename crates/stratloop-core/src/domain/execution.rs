//! `ExecutionResult`: what one run of a strategy produced.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome of a single run attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `true` when the process exited with status 0.
    pub succeeded: bool,
    /// Process exit code; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// stdout and stderr merged in arrival order.
    pub combined_output: String,
    /// Result files (charts, logs) announced in the output.
    pub derived_paths: Vec<PathBuf>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(combined_output: impl Into<String>, derived_paths: Vec<PathBuf>) -> Self {
        Self {
            succeeded: true,
            exit_code: Some(0),
            combined_output: combined_output.into(),
            derived_paths,
            duration_ms: 0,
        }
    }

    pub fn failure(exit_code: Option<i32>, combined_output: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exit_code,
            combined_output: combined_output.into(),
            derived_paths: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Human-readable exit indicator.
    pub fn exit_indicator(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// The last `n` lines of output.
    pub fn output_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.combined_output.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}
