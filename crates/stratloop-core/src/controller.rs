//! Repair Loop Controller.
//!
//! ```text
//! GENERATING -> RUNNING -> SUCCEEDED
//!                  |  ^
//!                  v  |
//!                 FIXING --(no code)--> UNREPAIRABLE
//!                  |
//!                  +--(budget spent)--> EXHAUSTED
//! ```
//!
//! The loop is iterative. `iteration_count` counts fix attempts: a failed
//! run with `iteration_count == max_iterations` ends in `EXHAUSTED`,
//! otherwise the count is incremented and a fix is requested. A strategy
//! is therefore run at most `max_iterations + 1` times per request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratloop_llm::{ChatService, PromptLibrary, Role, TemplateName};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::analysis;
use crate::conversation::{Conversation, ConversationLimits};
use crate::domain::{CodeArtifact, ExecutionResult, ForgeError, Result, TradingParams};
use crate::error_context::{ErrorContext, ErrorContextConfig, ErrorContextExtractor};
use crate::extraction::{CodeExtractor, ExtractionRules};
use crate::obs;
use crate::runner::StrategyRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Fix attempts allowed per request.
    pub max_iterations: u32,
    /// Ask the service to analyse successful runs.
    pub analyze_results: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            analyze_results: true,
        }
    }
}

/// How service responses are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Buffered,
    #[default]
    Streaming,
}

/// Everything the controller needs besides its collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mode: ResponseMode,
    #[serde(rename = "loop")]
    pub loop_config: LoopConfig,
    pub conversation: ConversationLimits,
    pub extraction: ExtractionRules,
    pub error_context: ErrorContextConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Idle,
    Generating,
    Running,
    Fixing,
    Succeeded,
    Exhausted,
    Unrepairable,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "IDLE",
            LoopState::Generating => "GENERATING",
            LoopState::Running => "RUNNING",
            LoopState::Fixing => "FIXING",
            LoopState::Succeeded => "SUCCEEDED",
            LoopState::Exhausted => "EXHAUSTED",
            LoopState::Unrepairable => "UNREPAIRABLE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Succeeded | LoopState::Exhausted | LoopState::Unrepairable
        )
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request loop state. Only the controller writes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSession {
    pub id: Uuid,
    pub request: Option<String>,
    pub iteration_count: u32,
    pub current_artifact: Option<CodeArtifact>,
    pub last_execution: Option<ExecutionResult>,
    pub last_error: Option<ErrorContext>,
    pub state: LoopState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RepairSession {
    fn begin(request: Option<String>, carried: Option<CodeArtifact>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            iteration_count: 0,
            current_artifact: carried,
            last_execution: None,
            last_error: None,
            state: LoopState::Idle,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Which request produced a response with no usable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generation,
    Modification,
    Fix,
}

/// Terminal result of one loop. These are ordinary outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairOutcome {
    Succeeded {
        artifact: CodeArtifact,
        execution: ExecutionResult,
        analysis: Option<String>,
    },
    Exhausted {
        artifact: CodeArtifact,
        last_error: ErrorContext,
        execution: ExecutionResult,
    },
    Unrepairable {
        phase: Phase,
        /// The response that contained no code, verbatim.
        response: String,
        artifact: Option<CodeArtifact>,
        last_error: Option<ErrorContext>,
        /// The failed run being fixed, when there was one.
        execution: Option<ExecutionResult>,
    },
}

impl RepairOutcome {
    pub fn state(&self) -> LoopState {
        match self {
            RepairOutcome::Succeeded { .. } => LoopState::Succeeded,
            RepairOutcome::Exhausted { .. } => LoopState::Exhausted,
            RepairOutcome::Unrepairable { .. } => LoopState::Unrepairable,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RepairOutcome::Succeeded { .. })
    }

    /// Last known code, if any.
    pub fn artifact(&self) -> Option<&CodeArtifact> {
        match self {
            RepairOutcome::Succeeded { artifact, .. } | RepairOutcome::Exhausted { artifact, .. } => {
                Some(artifact)
            }
            RepairOutcome::Unrepairable { artifact, .. } => artifact.as_ref(),
        }
    }

    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self {
            RepairOutcome::Succeeded { execution, .. } | RepairOutcome::Exhausted { execution, .. } => {
                Some(execution)
            }
            RepairOutcome::Unrepairable { execution, .. } => execution.as_ref(),
        }
    }

    /// Human-readable summary for the caller.
    pub fn message(&self) -> String {
        match self {
            RepairOutcome::Succeeded { execution, .. } => {
                if execution.derived_paths.is_empty() {
                    "strategy ran successfully".to_string()
                } else {
                    format!(
                        "strategy ran successfully; {} result file(s) written",
                        execution.derived_paths.len()
                    )
                }
            }
            RepairOutcome::Exhausted { last_error, .. } => format!(
                "strategy still failing after {} fix attempt(s); last error:\n{}",
                last_error.iteration, last_error.excerpt
            ),
            RepairOutcome::Unrepairable {
                phase,
                response,
                last_error,
                ..
            } => match (phase, last_error) {
                (Phase::Fix, Some(error)) => format!(
                    "the fix attempt returned no usable code. Error being fixed:\n{}\n\nResponse:\n{}",
                    error.excerpt, response
                ),
                (Phase::Modification, _) => {
                    format!("the modification returned no usable code. Response:\n{}", response)
                }
                _ => format!("no usable code found in the response:\n{}", response),
            },
        }
    }
}

/// Progress notifications for a live display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent<'a> {
    /// A fragment of a streamed service response.
    ResponseChunk(&'a str),
    /// One line of strategy output.
    OutputLine(&'a str),
    Status(&'a str),
}

pub type EventSink<'s> = &'s mut (dyn for<'e> FnMut(LoopEvent<'e>) + Send);

/// Drives one request through generate, run, diagnose and repair.
pub struct RepairController {
    service: Arc<dyn ChatService>,
    runner: Arc<dyn StrategyRunner>,
    prompts: Arc<PromptLibrary>,
    extractor: CodeExtractor,
    error_extractor: ErrorContextExtractor,
    conversation: Conversation,
    session: RepairSession,
    config: ControllerConfig,
    system_ready: bool,
}

impl RepairController {
    pub fn new(
        service: Arc<dyn ChatService>,
        runner: Arc<dyn StrategyRunner>,
        prompts: Arc<PromptLibrary>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let extractor = CodeExtractor::new(config.extraction.clone())?;
        let error_extractor = ErrorContextExtractor::new(config.error_context.clone());
        let conversation = Conversation::new(
            TemplateName::SystemPrompt.fallback(),
            config.conversation,
        );
        Ok(Self {
            service,
            runner,
            prompts,
            extractor,
            error_extractor,
            conversation,
            session: RepairSession::begin(None, None),
            config,
            system_ready: false,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn mode(&self) -> ResponseMode {
        self.config.mode
    }

    pub fn set_mode(&mut self, mode: ResponseMode) {
        self.config.mode = mode;
    }

    pub fn session(&self) -> &RepairSession {
        &self.session
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn current_artifact(&self) -> Option<&CodeArtifact> {
        self.session.current_artifact.as_ref()
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Clear history back to the system prompt. The current strategy is kept.
    pub fn reset_conversation(&mut self) {
        self.conversation.reset();
    }

    /// Replace the history, e.g. with one loaded from disk.
    pub fn replace_conversation(&mut self, conversation: Conversation) {
        self.conversation = conversation;
        self.system_ready = true;
    }

    /// Make `artifact` the current strategy without running it.
    pub fn adopt(&mut self, artifact: CodeArtifact) {
        self.session.current_artifact = Some(artifact);
    }

    /// Generate a strategy for `request` and run it until it succeeds or
    /// the loop gives up.
    pub async fn generate(
        &mut self,
        request: &str,
        params: &TradingParams,
        sink: EventSink<'_>,
    ) -> Result<RepairOutcome> {
        self.session = RepairSession::begin(
            Some(request.to_string()),
            self.session.current_artifact.take(),
        );
        let span = obs::session_span(&self.session.id.to_string());
        self.generate_in_session(request, params, sink)
            .instrument(span)
            .await
    }

    async fn generate_in_session(
        &mut self,
        request: &str,
        params: &TradingParams,
        sink: EventSink<'_>,
    ) -> Result<RepairOutcome> {
        obs::emit_loop_started(
            &self.session.id.to_string(),
            "generation",
            self.config.loop_config.max_iterations,
        );

        self.session.state = LoopState::Generating;
        sink(LoopEvent::Status("generating strategy"));

        let mut values = vec![("user_query", request)];
        values.extend(params.template_values());
        let prompt = self.prompts.render(TemplateName::GenerateStrategy, &values).await;
        let response = self.ask(prompt, sink).await?;

        match self.extractor.extract(&response) {
            Some(artifact) => {
                self.session.current_artifact = Some(artifact);
                self.run_loop(sink).await
            }
            None => Ok(self.finish(RepairOutcome::Unrepairable {
                phase: Phase::Generation,
                response,
                artifact: self.session.current_artifact.clone(),
                last_error: None,
                execution: None,
            })),
        }
    }

    /// Ask for a change to the current strategy, then run the result.
    pub async fn modify(&mut self, request: &str, sink: EventSink<'_>) -> Result<RepairOutcome> {
        let current = self
            .session
            .current_artifact
            .clone()
            .ok_or(ForgeError::NoStrategy)?;
        self.session = RepairSession::begin(Some(request.to_string()), Some(current.clone()));
        let span = obs::session_span(&self.session.id.to_string());
        self.modify_in_session(request, current, sink)
            .instrument(span)
            .await
    }

    async fn modify_in_session(
        &mut self,
        request: &str,
        current: CodeArtifact,
        sink: EventSink<'_>,
    ) -> Result<RepairOutcome> {
        obs::emit_loop_started(
            &self.session.id.to_string(),
            "modification",
            self.config.loop_config.max_iterations,
        );

        self.session.state = LoopState::Generating;
        sink(LoopEvent::Status("modifying strategy"));

        let prompt = self
            .prompts
            .render(
                TemplateName::ModifyStrategy,
                &[
                    ("current_strategy_code", current.source_text()),
                    ("modification_request", request),
                ],
            )
            .await;
        let response = self.ask(prompt, sink).await?;

        match self.extractor.extract(&response) {
            Some(artifact) => {
                self.session.current_artifact = Some(artifact);
                self.run_loop(sink).await
            }
            None => Ok(self.finish(RepairOutcome::Unrepairable {
                phase: Phase::Modification,
                response,
                artifact: Some(current),
                last_error: None,
                execution: None,
            })),
        }
    }

    /// Run (and repair if needed) the current strategy.
    pub async fn run(&mut self, sink: EventSink<'_>) -> Result<RepairOutcome> {
        let current = self
            .session
            .current_artifact
            .take()
            .ok_or(ForgeError::NoStrategy)?;
        self.session = RepairSession::begin(None, Some(current));
        let session_id = self.session.id.to_string();
        obs::emit_loop_started(&session_id, "run", self.config.loop_config.max_iterations);
        self.run_loop(sink).instrument(obs::session_span(&session_id)).await
    }

    async fn run_loop(&mut self, sink: EventSink<'_>) -> Result<RepairOutcome> {
        let max_iterations = self.config.loop_config.max_iterations;
        loop {
            let artifact = self
                .session
                .current_artifact
                .clone()
                .ok_or(ForgeError::NoStrategy)?;

            self.session.state = LoopState::Running;
            sink(LoopEvent::Status("running strategy"));
            let execution = self.execute(&artifact, sink).await?;
            self.session.last_execution = Some(execution.clone());

            if execution.succeeded {
                let analysis = if self.config.loop_config.analyze_results {
                    self.analyze(&execution, sink).await
                } else {
                    None
                };
                return Ok(self.finish(RepairOutcome::Succeeded {
                    artifact,
                    execution,
                    analysis,
                }));
            }

            if self.session.iteration_count >= max_iterations {
                let last_error = self
                    .error_extractor
                    .extract(&execution.combined_output, self.session.iteration_count);
                self.session.last_error = Some(last_error.clone());
                return Ok(self.finish(RepairOutcome::Exhausted {
                    artifact,
                    last_error,
                    execution,
                }));
            }

            self.session.iteration_count += 1;
            self.session.state = LoopState::Fixing;
            let context = self
                .error_extractor
                .extract(&execution.combined_output, self.session.iteration_count);
            self.session.last_error = Some(context.clone());
            obs::emit_loop_iteration(
                &self.session.id.to_string(),
                self.session.iteration_count,
                context.kind.as_str(),
                context.line_count(),
            );
            let status = format!(
                "run failed ({}); requesting fix {}/{}",
                execution.exit_indicator(),
                self.session.iteration_count,
                max_iterations
            );
            sink(LoopEvent::Status(&status));

            let prompt = self
                .prompts
                .render(
                    TemplateName::FixStrategy,
                    &[
                        ("error_info", context.excerpt.as_str()),
                        ("strategy_code", artifact.source_text()),
                    ],
                )
                .await;
            let response = self.ask(prompt, sink).await?;

            match self.extractor.extract(&response) {
                Some(fixed) => {
                    debug!(
                        iteration = self.session.iteration_count,
                        artifact = %fixed.fingerprint(),
                        "fix extracted"
                    );
                    self.session.current_artifact = Some(fixed);
                }
                None => {
                    return Ok(self.finish(RepairOutcome::Unrepairable {
                        phase: Phase::Fix,
                        response,
                        artifact: Some(artifact),
                        last_error: Some(context),
                        execution: Some(execution),
                    }))
                }
            }
        }
    }

    async fn execute(
        &self,
        artifact: &CodeArtifact,
        sink: EventSink<'_>,
    ) -> Result<ExecutionResult> {
        let result = match self.config.mode {
            ResponseMode::Buffered => self.runner.run(artifact, None).await,
            ResponseMode::Streaming => {
                let forward: &mut (dyn for<'a> FnMut(&'a str) + Send) =
                    &mut |line: &str| sink(LoopEvent::OutputLine(line));
                self.runner.run(artifact, Some(forward)).await
            }
        };
        result.map_err(|err| {
            warn!(error = %err, "strategy could not be run");
            ForgeError::from(err)
        })
    }

    async fn analyze(&mut self, execution: &ExecutionResult, sink: EventSink<'_>) -> Option<String> {
        sink(LoopEvent::Status("analysing results"));
        let digest = analysis::results_digest(execution);
        let prompt = self
            .prompts
            .render(TemplateName::Results, &[("results", digest.as_str())])
            .await;
        match self.ask(prompt, sink).await {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                warn!(error = %err, "result analysis failed");
                None
            }
        }
    }

    /// Send `prompt` as a user turn and return the full response. On
    /// failure the user turn stays in the history and no assistant turn is
    /// added.
    async fn ask(&mut self, prompt: String, sink: EventSink<'_>) -> Result<String> {
        self.ensure_system_prompt().await;
        self.conversation.append(Role::User, prompt);
        let snapshot = self.conversation.snapshot().to_vec();

        let response = match self.config.mode {
            ResponseMode::Buffered => self.service.complete(&snapshot).await,
            ResponseMode::Streaming => {
                let mut forward = |chunk: &str| sink(LoopEvent::ResponseChunk(chunk));
                self.service.complete_streaming(&snapshot, &mut forward).await
            }
        };

        match response {
            Ok(text) => {
                self.conversation.append(Role::Assistant, text.clone());
                Ok(text)
            }
            Err(err) => {
                warn!(service = self.service.name(), error = %err, "service request failed");
                Err(err.into())
            }
        }
    }

    async fn ensure_system_prompt(&mut self) {
        if self.system_ready {
            return;
        }
        let lookup = self.prompts.get_template(TemplateName::SystemPrompt).await;
        if self.conversation.len() == 1 && lookup.text != self.conversation.system_prompt() {
            self.conversation = Conversation::new(lookup.text, self.config.conversation);
        }
        self.system_ready = true;
    }

    fn finish(&mut self, outcome: RepairOutcome) -> RepairOutcome {
        let state = outcome.state();
        let finished_at = Utc::now();
        self.session.state = state;
        self.session.finished_at = Some(finished_at);
        let duration_ms = (finished_at - self.session.started_at)
            .num_milliseconds()
            .max(0) as u64;
        obs::emit_loop_finished(
            &self.session.id.to_string(),
            state.as_str(),
            self.session.iteration_count,
            duration_ms,
        );
        info!(state = %state, iterations = self.session.iteration_count, "repair loop finished");
        outcome
    }
}
