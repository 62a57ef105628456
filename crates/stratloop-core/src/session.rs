//! Caller-facing operations for a UI or CLI.
//!
//! Every operation returns a [`Reply`]: success flag, human-readable
//! message and whatever payload is available. Errors never escape as
//! `Err`; they become unsuccessful replies that still carry the last known
//! code so the user can intervene by hand.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::{EventSink, LoopState, RepairController, RepairOutcome};
use crate::conversation::Conversation;
use crate::domain::{CodeArtifact, ForgeError, Result, TradingParams};
use crate::persistence::{self, SessionRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub state: Option<LoopState>,
    pub code: Option<String>,
    pub output: Option<String>,
    pub derived_paths: Vec<PathBuf>,
    pub analysis: Option<String>,
    /// Service response that contained no usable code.
    pub response: Option<String>,
    /// File written by the operation.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    pub message: String,
    pub payload: ReplyPayload,
}

impl Reply {
    pub fn ok(message: impl Into<String>, payload: ReplyPayload) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload,
        }
    }

    pub fn failed(message: impl Into<String>, payload: ReplyPayload) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload,
        }
    }

    fn from_outcome(outcome: &RepairOutcome) -> Self {
        let mut payload = ReplyPayload {
            state: Some(outcome.state()),
            code: outcome.artifact().map(|a| a.source_text().to_string()),
            ..ReplyPayload::default()
        };
        if let Some(execution) = outcome.execution() {
            payload.output = Some(execution.combined_output.clone());
            payload.derived_paths = execution.derived_paths.clone();
        }
        match outcome {
            RepairOutcome::Succeeded { analysis, .. } => payload.analysis = analysis.clone(),
            RepairOutcome::Unrepairable { response, .. } => payload.response = Some(response.clone()),
            RepairOutcome::Exhausted { .. } => {}
        }

        Self {
            success: outcome.is_success(),
            message: outcome.message(),
            payload,
        }
    }
}

/// One user's interactive session: a controller plus the fixed trading
/// parameters and the output locations.
pub struct StrategySession {
    controller: RepairController,
    params: TradingParams,
    output_dir: PathBuf,
    session_dir: Option<PathBuf>,
    last_outcome: Option<RepairOutcome>,
}

impl StrategySession {
    pub fn new(controller: RepairController, params: TradingParams, output_dir: PathBuf) -> Self {
        Self {
            controller,
            params,
            output_dir,
            session_dir: None,
            last_outcome: None,
        }
    }

    /// Record every finished loop under `dir` (see `write_session_artifact`).
    pub fn with_session_dir(mut self, dir: PathBuf) -> Self {
        self.session_dir = Some(dir);
        self
    }

    pub fn params(&self) -> &TradingParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut TradingParams {
        &mut self.params
    }

    pub fn controller(&self) -> &RepairController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut RepairController {
        &mut self.controller
    }

    pub fn last_outcome(&self) -> Option<&RepairOutcome> {
        self.last_outcome.as_ref()
    }

    /// Generate a strategy for `request` with `params` and run it.
    pub async fn generate(
        &mut self,
        request: &str,
        params: TradingParams,
        sink: EventSink<'_>,
    ) -> Reply {
        self.params = params;
        let result = self.controller.generate(request, &self.params, sink).await;
        self.conclude(result)
    }

    pub async fn modify(&mut self, request: &str, sink: EventSink<'_>) -> Reply {
        let result = self.controller.modify(request, sink).await;
        self.conclude(result)
    }

    pub async fn run(&mut self, sink: EventSink<'_>) -> Reply {
        let result = self.controller.run(sink).await;
        self.conclude(result)
    }

    /// Make the strategy in `path` current without running it.
    pub fn load_strategy_file(&mut self, path: &Path) -> Reply {
        match std::fs::read_to_string(path) {
            Ok(code) => {
                self.controller.adopt(CodeArtifact::from_source(code.clone()));
                Reply::ok(
                    format!("loaded strategy from {}", path.display()),
                    ReplyPayload {
                        code: Some(code),
                        path: Some(path.to_path_buf()),
                        ..ReplyPayload::default()
                    },
                )
            }
            Err(err) => self.failure(ForgeError::from(err)),
        }
    }

    /// Clear the conversation; the current strategy stays.
    pub fn reset_conversation(&mut self) -> Reply {
        self.controller.reset_conversation();
        Reply::ok(
            "conversation reset; the current strategy is kept",
            self.current_payload(),
        )
    }

    pub fn save_current_artifact(&self, name: Option<&str>) -> Reply {
        let Some(artifact) = self.controller.current_artifact() else {
            return self.failure(ForgeError::NoStrategy);
        };
        match persistence::save_strategy(&self.output_dir, artifact.source_text(), name) {
            Ok(path) => Reply::ok(
                format!("strategy saved to {}", path.display()),
                ReplyPayload {
                    code: Some(artifact.source_text().to_string()),
                    path: Some(path),
                    ..ReplyPayload::default()
                },
            ),
            Err(err) => self.failure(err),
        }
    }

    /// Output, result files and analysis of the most recent loop.
    pub fn fetch_last_results(&self) -> Reply {
        match &self.last_outcome {
            Some(outcome) => Reply::from_outcome(outcome),
            None => Reply::failed("no results yet; run a strategy first", ReplyPayload::default()),
        }
    }

    pub fn save_conversation(&self, path: &Path) -> Reply {
        match self.controller.conversation().save(path) {
            Ok(()) => Reply::ok(
                format!("conversation saved to {}", path.display()),
                ReplyPayload {
                    path: Some(path.to_path_buf()),
                    ..ReplyPayload::default()
                },
            ),
            Err(err) => self.failure(err),
        }
    }

    pub fn load_conversation(&mut self, path: &Path) -> Reply {
        let limits = *self.controller.conversation().limits();
        match Conversation::load(path, limits) {
            Ok(conversation) => {
                let count = conversation.len();
                self.controller.replace_conversation(conversation);
                Reply::ok(
                    format!("loaded {} message(s) from {}", count, path.display()),
                    ReplyPayload {
                        path: Some(path.to_path_buf()),
                        ..ReplyPayload::default()
                    },
                )
            }
            Err(err) => self.failure(err),
        }
    }

    fn conclude(&mut self, result: Result<RepairOutcome>) -> Reply {
        match result {
            Ok(outcome) => {
                let reply = Reply::from_outcome(&outcome);
                self.record(&outcome);
                self.last_outcome = Some(outcome);
                reply
            }
            Err(err) => self.failure(err),
        }
    }

    fn record(&self, outcome: &RepairOutcome) {
        let Some(dir) = &self.session_dir else {
            return;
        };
        let record = SessionRecord {
            session: self.controller.session().clone(),
            params: self.params.clone(),
            conversation: self.controller.conversation().snapshot().to_vec(),
            outcome: Some(outcome.clone()),
            recorded_at: Utc::now(),
        };
        if let Err(err) = persistence::write_session_artifact(&record, dir) {
            warn!(error = %err, "failed to record session");
        }
    }

    fn current_payload(&self) -> ReplyPayload {
        ReplyPayload {
            state: Some(self.controller.session().state),
            code: self
                .controller
                .current_artifact()
                .map(|a| a.source_text().to_string()),
            ..ReplyPayload::default()
        }
    }

    fn failure(&self, err: ForgeError) -> Reply {
        Reply::failed(err.to_string(), self.current_payload())
    }
}
