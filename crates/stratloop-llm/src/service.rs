//! The `ChatService` trait: the only way the loop talks to a model.

use async_trait::async_trait;

use crate::error::LlmResult;
use crate::message::Message;

/// A remote text-generation service.
///
/// A request always carries the full conversation snapshot. Implementations
/// may deliver the reply in one piece or as incremental fragments; either
/// way the returned `String` is the complete response, and callers must not
/// depend on how it was chunked.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Request a full response for the given conversation.
    async fn complete(&self, messages: &[Message]) -> LlmResult<String>;

    /// Request a response, delivering fragments to `on_chunk` as they arrive.
    ///
    /// The default implementation waits for [`ChatService::complete`] and
    /// delivers the whole text as a single fragment.
    async fn complete_streaming(
        &self,
        messages: &[Message],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> LlmResult<String> {
        let text = self.complete(messages).await?;
        on_chunk(&text);
        Ok(text)
    }

    /// Short human-readable name used in logs.
    fn name(&self) -> &str {
        "chat-service"
    }
}
