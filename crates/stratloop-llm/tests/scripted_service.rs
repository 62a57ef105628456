//! Contract tests for the `ChatService` fakes: both delivery modes must
//! yield the same full response.

use async_trait::async_trait;
use stratloop_llm::fakes::ScriptedChatService;
use stratloop_llm::{ChatService, LlmError, LlmResult, Message};

/// Implements only `complete`, so streaming goes through the trait default.
struct EchoService;

#[async_trait]
impl ChatService for EchoService {
    async fn complete(&self, messages: &[Message]) -> LlmResult<String> {
        Ok(messages
            .last()
            .map(|m| format!("echo: {}", m.content))
            .unwrap_or_default())
    }
}

#[tokio::test]
async fn buffered_and_streamed_replies_are_identical() {
    let reply = "```python\nprint('均线')\n```";
    let buffered = ScriptedChatService::with_replies([reply]);
    let streamed = ScriptedChatService::with_replies([reply]).with_chunk_size(3);

    let conversation = [Message::system("sys"), Message::user("go")];
    let full = buffered.complete(&conversation).await.unwrap();

    let mut pieces = Vec::new();
    let mut sink = |s: &str| pieces.push(s.to_string());
    let streamed_full = streamed
        .complete_streaming(&conversation, &mut sink)
        .await
        .unwrap();

    assert_eq!(full, streamed_full);
    assert!(pieces.len() > 1);
    assert_eq!(pieces.concat(), full);
}

#[tokio::test]
async fn requests_are_recorded_in_order() {
    let service = ScriptedChatService::with_replies(["a", "b"]);
    service.complete(&[Message::user("first")]).await.unwrap();
    service
        .complete(&[Message::user("first"), Message::user("second")])
        .await
        .unwrap();

    assert_eq!(service.request_count(), 2);
    assert_eq!(service.requests()[1].len(), 2);
    assert_eq!(service.last_prompt().unwrap().content, "second");
}

#[tokio::test]
async fn queued_failure_surfaces_as_http_error() {
    let service = ScriptedChatService::new();
    service.push_failure("connection reset");

    let err = service.complete(&[Message::user("x")]).await.unwrap_err();
    assert!(matches!(err, LlmError::Http(ref r) if r == "connection reset"));
}

#[tokio::test]
async fn drained_queue_uses_repeat_reply() {
    let service = ScriptedChatService::with_replies(["once"]).repeating("again");
    assert_eq!(service.complete(&[]).await.unwrap(), "once");
    assert_eq!(service.complete(&[]).await.unwrap(), "again");
    assert_eq!(service.complete(&[]).await.unwrap(), "again");
}

#[tokio::test]
async fn default_streaming_delivers_the_whole_reply_once() {
    let service = EchoService;
    let mut pieces: Vec<String> = Vec::new();
    let mut sink = |s: &str| pieces.push(s.to_owned());

    let full = service
        .complete_streaming(&[Message::user("ma cross")], &mut sink)
        .await
        .unwrap();

    assert_eq!(full, "echo: ma cross");
    assert_eq!(pieces, vec!["echo: ma cross".to_string()]);
}

#[tokio::test]
async fn streaming_sink_is_usable_through_a_trait_object() {
    let service: Box<dyn ChatService> =
        Box::new(ScriptedChatService::with_replies(["短暂的回复"]).with_chunk_size(2));
    let mut count = 0usize;
    let mut sink = |s: &str| count += s.chars().count();

    let full = service
        .complete_streaming(&[Message::user("x")], &mut sink)
        .await
        .unwrap();

    assert_eq!(count, full.chars().count());
}
