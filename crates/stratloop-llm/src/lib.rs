//! stratloop-llm: the remote text-generation service boundary.
//!
//! The repair loop never talks HTTP directly. It depends on the
//! [`ChatService`] trait for completions and on a [`PromptLibrary`] for
//! prompt templates; this crate provides the production implementations of
//! both plus in-memory fakes for tests.

mod error;
pub mod fakes;
mod message;
pub mod openai;
pub mod prompts;
mod service;

pub use error::{LlmError, LlmResult};
pub use message::{Message, Role};
pub use openai::{LlmConfig, OpenAiChatClient};
pub use prompts::{
    render, HttpTemplateSource, PromptLibrary, PromptServerConfig, TemplateLookup, TemplateName,
    TemplateOrigin, TemplateSource,
};
pub use service::ChatService;
