//! Execution Adapter: run a strategy as an external process.
//!
//! The artifact is written into a fresh temporary directory under the
//! configured work directory and executed with the configured
//! interpreter. stdout and stderr are read concurrently and merged line by
//! line in arrival order. The child is killed and the temporary directory
//! removed on every exit path, including when the calling future is
//! dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{CodeArtifact, ExecutionError, ExecutionResult, ForgeError};
use crate::obs;

/// Runs a strategy artifact to completion.
///
/// A strategy that runs and exits non-zero is an `Ok` result with
/// `succeeded = false`. `Err` means the run could not happen at all.
#[async_trait]
pub trait StrategyRunner: Send + Sync {
    /// When `sink` is given it receives every output line as it arrives.
    async fn run(
        &self,
        artifact: &CodeArtifact,
        sink: Option<&mut (dyn for<'a> FnMut(&'a str) + Send)>,
    ) -> Result<ExecutionResult, ExecutionError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub interpreter: String,
    /// Arguments placed before the script path.
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub script_name: String,
    /// Zero disables the limit.
    pub timeout_secs: u64,
    pub env: Vec<(String, String)>,
    /// Literal text that precedes `:` / `：` and a result file path.
    pub path_markers: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            args: Vec::new(),
            work_dir: PathBuf::from("ai_strategies"),
            script_name: "strategy.py".to_string(),
            timeout_secs: 300,
            env: vec![
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ],
            path_markers: [
                "绩效报告已保存到",
                "回测图表已保存到",
                "综合收益图表已保存到",
                "saved to",
                "written to",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Finds result-file paths announced in run output.
#[derive(Debug, Clone)]
pub struct PathScanner {
    pattern: Option<Regex>,
}

impl PathScanner {
    pub fn new(markers: &[String]) -> Result<Self, ForgeError> {
        if markers.is_empty() {
            return Ok(Self { pattern: None });
        }
        let alternation = markers
            .iter()
            .map(|m| regex::escape(m))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(r"(?m)(?:{})\s*[:：]\s*(\S[^\r\n]*?)\s*$", alternation);
        let pattern = Regex::new(&pattern).map_err(|e| ForgeError::InvalidRule {
            pattern,
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// Paths in order of first appearance, without duplicates.
    pub fn scan(&self, output: &str) -> Vec<PathBuf> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        for caps in pattern.captures_iter(output) {
            let Some(raw) = caps.get(1) else { continue };
            let cleaned = raw.as_str().trim_matches(|c: char| c == '"' || c == '\'' || c == '`');
            if cleaned.is_empty() {
                continue;
            }
            let path = PathBuf::from(cleaned);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }
}

/// [`StrategyRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
    scanner: PathScanner,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Result<Self, ForgeError> {
        let scanner = PathScanner::new(&config.path_markers)?;
        Ok(Self { config, scanner })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn persist(&self, artifact: &CodeArtifact) -> Result<(tempfile::TempDir, PathBuf), ExecutionError> {
        let work_dir = &self.config.work_dir;
        std::fs::create_dir_all(work_dir).map_err(|source| ExecutionError::Persist {
            path: work_dir.clone(),
            source,
        })?;
        // the child runs inside work_dir, so the script path must not be relative to it
        let work_dir = std::path::absolute(work_dir).map_err(|source| ExecutionError::Persist {
            path: work_dir.clone(),
            source,
        })?;
        let dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&work_dir)
            .map_err(|source| ExecutionError::Persist {
                path: work_dir.clone(),
                source,
            })?;
        let script = dir.path().join(&self.config.script_name);
        std::fs::write(&script, artifact.source_text()).map_err(|source| {
            ExecutionError::Persist {
                path: script.clone(),
                source,
            }
        })?;
        Ok((dir, script))
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.args)
            .arg(script)
            .current_dir(&self.config.work_dir)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(&['\n', '\r'][..]).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "failed reading strategy output");
                break;
            }
        }
    }
}

#[async_trait]
impl StrategyRunner for ProcessRunner {
    async fn run(
        &self,
        artifact: &CodeArtifact,
        mut sink: Option<&mut (dyn for<'a> FnMut(&'a str) + Send)>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        // removed when dropped, on every path out of this function
        let (_dir, script) = self.persist(artifact)?;

        let mut child = self
            .command(&script)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: self.config.interpreter.clone(),
                source,
            })?;
        debug!(
            interpreter = %self.config.interpreter,
            script = %script.display(),
            artifact = %artifact.fingerprint(),
            "strategy process spawned"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
        drop(tx);

        let collect = async {
            let mut combined = String::new();
            let mut lines = 0usize;
            while let Some(line) = rx.recv().await {
                if let Some(sink) = sink.as_deref_mut() {
                    sink(&line);
                }
                combined.push_str(&line);
                combined.push('\n');
                lines += 1;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((combined, lines, status))
        };

        let outcome = if self.config.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), collect).await
        } else {
            Ok(collect.await)
        };

        let (combined, lines, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(limit_secs = self.config.timeout_secs, "strategy run timed out");
                child.start_kill().ok();
                for reader in readers {
                    reader.abort();
                }
                return Err(ExecutionError::Timeout {
                    limit_secs: self.config.timeout_secs,
                });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let derived_paths = self.scanner.scan(&combined);
        obs::emit_execution_finished(status.code(), lines, derived_paths.len(), duration_ms);

        let result = if status.success() {
            ExecutionResult::success(combined, derived_paths)
        } else {
            ExecutionResult {
                derived_paths,
                ..ExecutionResult::failure(status.code(), combined)
            }
        };
        Ok(result.with_duration_ms(duration_ms))
    }
}
