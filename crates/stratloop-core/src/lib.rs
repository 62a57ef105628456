//! stratloop core library
//!
//! Turns a natural-language strategy request into runnable code, runs it,
//! and repairs it from its own error output until it succeeds or the
//! iteration budget is spent.

pub mod analysis;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod domain;
pub mod error_context;
pub mod extraction;
pub mod fakes;
pub mod obs;
pub mod persistence;
pub mod runner;
pub mod session;
pub mod telemetry;

pub use config::ForgeConfig;

pub use controller::{
    ControllerConfig, EventSink, LoopConfig, LoopEvent, LoopState, Phase, RepairController,
    RepairOutcome, RepairSession, ResponseMode,
};

pub use conversation::{
    CharRatioEstimator, Conversation, ConversationLimits, EstimateError, SizeEstimator, Trim,
};

pub use domain::{
    CodeArtifact, ExecutionError, ExecutionResult, ForgeError, Result, TradingParams,
};

pub use error_context::{ErrorContext, ErrorContextConfig, ErrorContextExtractor, ErrorKind};
pub use extraction::{CodeExtractor, ExtractionRules, Preference};
pub use persistence::{
    read_session_artifact, save_strategy, write_session_artifact, SessionRecord,
};
pub use runner::{PathScanner, ProcessRunner, RunnerConfig, StrategyRunner};
pub use session::{Reply, ReplyPayload, StrategySession};

pub use stratloop_llm::{Message, Role};
