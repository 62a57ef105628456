//! In-memory fakes for the service traits (testing only)
//!
//! Provides `ScriptedChatService` and `StaticTemplateSource`, which satisfy
//! the trait contracts without any network access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{LlmError, LlmResult};
use crate::message::Message;
use crate::prompts::{TemplateName, TemplateSource};
use crate::service::ChatService;

// ---------------------------------------------------------------------------
// ScriptedChatService
// ---------------------------------------------------------------------------

enum Scripted {
    Reply(String),
    Fail(String),
}

/// Chat service that answers from a queue of canned replies.
///
/// Every request's conversation snapshot is recorded so tests can assert on
/// exactly what was sent. When the queue is empty the `repeat` reply (if
/// any) is returned, otherwise the call fails with `EmptyResponse`.
#[derive(Default)]
pub struct ScriptedChatService {
    queue: Mutex<VecDeque<Scripted>>,
    repeat: Mutex<Option<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
    chunk_size: usize,
}

impl ScriptedChatService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies in order.
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = Self::new();
        for reply in replies {
            service.push_reply(reply);
        }
        service
    }

    /// Reply returned once the queue is drained.
    pub fn repeating(self, reply: impl Into<String>) -> Self {
        if let Ok(mut repeat) = self.repeat.lock() {
            *repeat = Some(reply.into());
        }
        self
    }

    /// Split streamed replies into fragments of this many characters.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Reply(reply.into()));
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Fail(reason.into()));
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Snapshot of every conversation sent, oldest first.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// The final message of the most recent request.
    pub fn last_prompt(&self) -> Option<Message> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.last().cloned())
    }

    fn next(&self, messages: &[Message]) -> LlmResult<String> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let scripted = self.queue.lock().unwrap().pop_front();
        match scripted {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Fail(reason)) => Err(LlmError::Http(reason)),
            None => self
                .repeat
                .lock()
                .unwrap()
                .clone()
                .ok_or(LlmError::EmptyResponse),
        }
    }
}

#[async_trait]
impl ChatService for ScriptedChatService {
    async fn complete(&self, messages: &[Message]) -> LlmResult<String> {
        self.next(messages)
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> LlmResult<String> {
        let text = self.next(messages)?;
        if self.chunk_size == 0 {
            on_chunk(&text);
        } else {
            let chars: Vec<char> = text.chars().collect();
            for piece in chars.chunks(self.chunk_size) {
                let piece: String = piece.iter().collect();
                on_chunk(&piece);
            }
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// StaticTemplateSource
// ---------------------------------------------------------------------------

/// Template source backed by a fixed map; counts fetches.
#[derive(Debug, Default)]
pub struct StaticTemplateSource {
    templates: HashMap<TemplateName, String>,
    fetches: Mutex<usize>,
}

impl StaticTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: TemplateName, text: impl Into<String>) -> Self {
        self.templates.insert(name, text.into());
        self
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl TemplateSource for StaticTemplateSource {
    async fn fetch(&self, name: TemplateName) -> LlmResult<String> {
        *self.fetches.lock().unwrap() += 1;
        self.templates
            .get(&name)
            .cloned()
            .ok_or_else(|| LlmError::Template {
                name: name.to_string(),
                reason: "not found".to_string(),
            })
    }
}
