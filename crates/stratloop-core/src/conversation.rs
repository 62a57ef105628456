//! Conversation Store: the ordered message history sent to the
//! text-generation service, kept under a size budget.
//!
//! After every append the store applies, in order:
//!
//! 1. drop the oldest non-system messages while over `safe_tokens`
//! 2. collapse to `[system, second-to-last, last]` while over `warning_tokens`
//! 3. truncate any non-system message larger than half of `safe_tokens`
//!    to `truncate_ratio` of its characters
//!
//! and finally collapses to `[system, last]` if the total is still over the
//! safe threshold. If the estimator fails at any point the store collapses
//! to `[system, last]` instead of reporting the failure.

use std::path::Path;

use serde::{Deserialize, Serialize};
use stratloop_llm::{Message, Role};
use tracing::{debug, warn};

use crate::domain::{ForgeError, Result};
use crate::obs;

/// Size thresholds, in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationLimits {
    pub safe_tokens: usize,
    pub warning_tokens: usize,
    /// Fraction of characters kept when a single message is truncated.
    pub truncate_ratio: f64,
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self {
            safe_tokens: 45_000,
            warning_tokens: 55_000,
            truncate_ratio: 0.7,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstimateError {
    #[error("size estimate overflowed")]
    Overflow,

    #[error("size estimation failed: {0}")]
    Failed(String),
}

/// Approximate size of a message in tokens.
///
/// Implementations must be deterministic and monotonic in content length.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, message: &Message) -> std::result::Result<usize, EstimateError>;
}

/// Counts characters and divides by a fixed ratio (default 2 chars/token).
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub chars_per_token: usize,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self { chars_per_token: 2 }
    }
}

impl SizeEstimator for CharRatioEstimator {
    fn estimate(&self, message: &Message) -> std::result::Result<usize, EstimateError> {
        if self.chars_per_token == 0 {
            return Err(EstimateError::Failed("chars_per_token is zero".to_string()));
        }
        Ok(message.content.chars().count() / self.chars_per_token)
    }
}

/// What a single enforcement pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trim {
    pub dropped: usize,
    pub collapsed: bool,
    pub truncated: usize,
    pub fail_safe: bool,
}

impl Trim {
    pub fn changed(&self) -> bool {
        self.dropped > 0 || self.collapsed || self.truncated > 0 || self.fail_safe
    }
}

/// Ordered, size-bounded message history. The first message is always the
/// system prompt and the store is never empty.
pub struct Conversation {
    messages: Vec<Message>,
    limits: ConversationLimits,
    estimator: Box<dyn SizeEstimator>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("messages", &self.messages.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, limits: ConversationLimits) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            limits,
            estimator: Box::new(CharRatioEstimator::default()),
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn SizeEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Append a message and enforce the size budget.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> Trim {
        self.messages.push(Message::new(role, content));
        self.enforce()
    }

    /// The full ordered history, ready to send.
    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    /// Back to just the system prompt.
    pub fn reset(&mut self) {
        self.messages.truncate(1);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn limits(&self) -> &ConversationLimits {
        &self.limits
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    /// Current total, or `None` if the estimator fails.
    pub fn estimated_tokens(&self) -> Option<usize> {
        self.total().ok()
    }

    /// Remove the newest message if it has `role` (never the system prompt).
    pub fn pop_last_if(&mut self, role: Role) -> Option<Message> {
        if self.messages.len() > 1 && self.messages.last().map(|m| m.role) == Some(role) {
            self.messages.pop()
        } else {
            None
        }
    }

    /// Write the history as a pretty JSON array of `{role, content}`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.messages)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), messages = self.messages.len(), "conversation saved");
        Ok(())
    }

    /// Load a history written by [`Conversation::save`]. The loaded
    /// messages are kept verbatim; the budget applies from the next append.
    pub fn load(path: &Path, limits: ConversationLimits) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let messages: Vec<Message> = serde_json::from_str(&raw)?;
        Self::from_messages(messages, limits)
    }

    /// Rebuild a store from raw messages, validating the system-first rule.
    pub fn from_messages(messages: Vec<Message>, limits: ConversationLimits) -> Result<Self> {
        match messages.first() {
            None => {
                return Err(ForgeError::InvalidConversation(
                    "conversation is empty".to_string(),
                ))
            }
            Some(first) if first.role != Role::System => {
                return Err(ForgeError::InvalidConversation(format!(
                    "first message has role {}, expected system",
                    first.role
                )))
            }
            Some(_) => {}
        }
        Ok(Self {
            messages,
            limits,
            estimator: Box::new(CharRatioEstimator::default()),
        })
    }

    fn total(&self) -> std::result::Result<usize, EstimateError> {
        self.messages.iter().try_fold(0usize, |acc, m| {
            acc.checked_add(self.estimator.estimate(m)?)
                .ok_or(EstimateError::Overflow)
        })
    }

    fn collapse_to_last(&mut self) {
        if self.messages.len() > 2 {
            let last = self.messages.split_off(self.messages.len() - 1);
            self.messages.truncate(1);
            self.messages.extend(last);
        }
    }

    fn enforce(&mut self) -> Trim {
        let mut trim = Trim::default();
        let tokens = match self.apply_tiers(&mut trim) {
            Ok(tokens) => Some(tokens),
            Err(err) => {
                warn!(error = %err, "size estimation failed, collapsing conversation");
                self.collapse_to_last();
                trim.fail_safe = true;
                None
            }
        };
        if trim.changed() {
            obs::emit_conversation_trimmed(
                trim.dropped,
                trim.truncated,
                trim.collapsed,
                trim.fail_safe,
                tokens.unwrap_or(0),
            );
        }
        trim
    }

    fn apply_tiers(&mut self, trim: &mut Trim) -> std::result::Result<usize, EstimateError> {
        let safe = self.limits.safe_tokens;
        let mut total = self.total()?;

        // Tier 1
        while total > safe && self.messages.len() > 2 {
            self.messages.remove(1);
            trim.dropped += 1;
            total = self.total()?;
        }

        // Tier 2
        if total > self.limits.warning_tokens && self.messages.len() > 3 {
            let tail = self.messages.split_off(self.messages.len() - 2);
            self.messages.truncate(1);
            self.messages.extend(tail);
            trim.collapsed = true;
            total = self.total()?;
        }

        // Tier 3
        let per_message = safe / 2;
        for i in 1..self.messages.len() {
            if self.estimator.estimate(&self.messages[i])? > per_message {
                let content = &self.messages[i].content;
                let keep = (content.chars().count() as f64 * self.limits.truncate_ratio) as usize;
                let cut = content
                    .char_indices()
                    .nth(keep)
                    .map(|(idx, _)| idx)
                    .unwrap_or(content.len());
                self.messages[i].content.truncate(cut);
                trim.truncated += 1;
            }
        }
        if trim.truncated > 0 {
            total = self.total()?;
        }

        if total > safe && self.messages.len() > 2 {
            self.collapse_to_last();
            trim.collapsed = true;
            total = self.total()?;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> ConversationLimits {
        ConversationLimits {
            safe_tokens: 100,
            warning_tokens: 120,
            truncate_ratio: 0.7,
        }
    }

    #[test]
    fn test_new_conversation_has_only_system() {
        let conv = Conversation::new("sys", ConversationLimits::default());
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.snapshot()[0].role, Role::System);
        assert_eq!(conv.system_prompt(), "sys");
    }

    #[test]
    fn test_under_budget_append_changes_nothing() {
        let mut conv = Conversation::new("sys", ConversationLimits::default());
        let trim = conv.append(Role::User, "hello");
        assert!(!trim.changed());
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_warning_threshold_collapses_to_last_two() {
        let limits = ConversationLimits {
            safe_tokens: 100,
            warning_tokens: 20,
            truncate_ratio: 0.7,
        };
        let mut conv = Conversation::new("sys", limits);
        assert!(!conv.append(Role::User, "u".repeat(20)).changed());
        assert!(!conv.append(Role::Assistant, "a".repeat(20)).changed());
        let trim = conv.append(Role::User, "v".repeat(20));

        assert!(trim.collapsed);
        assert_eq!(trim.dropped, 0);
        assert_eq!(trim.truncated, 0);
        let snapshot = conv.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].role, Role::System);
        assert_eq!(snapshot[1].role, Role::Assistant);
        assert!(snapshot[1].content.starts_with('a'));
        assert_eq!(snapshot[2].content, "v".repeat(20));
    }

    #[test]
    fn test_oldest_messages_dropped_first() {
        let mut conv = Conversation::new("s", small_limits());
        conv.append(Role::User, "a".repeat(80)); // 40 tokens
        conv.append(Role::Assistant, "b".repeat(80));
        let trim = conv.append(Role::User, "c".repeat(80));

        assert_eq!(trim.dropped, 1);
        let snapshot = conv.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot[1].content.starts_with('b'));
        assert!(snapshot[2].content.starts_with('c'));
    }

    #[test]
    fn test_oversized_message_is_truncated_on_char_boundary() {
        let mut conv = Conversation::new("s", small_limits());
        // 120 chars -> 60 tokens, over half of safe (50)
        let trim = conv.append(Role::User, "均".repeat(120));
        assert_eq!(trim.truncated, 1);
        assert_eq!(conv.snapshot()[1].content.chars().count(), 84);
    }

    #[test]
    fn test_system_prompt_is_never_truncated() {
        let big_system = "x".repeat(400);
        let mut conv = Conversation::new(big_system.clone(), small_limits());
        conv.append(Role::User, "hi");
        assert_eq!(conv.snapshot()[0].content, big_system);
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut conv = Conversation::new("sys", ConversationLimits::default());
        conv.append(Role::User, "u");
        conv.append(Role::Assistant, "a");
        conv.reset();
        let once = conv.snapshot().to_vec();
        conv.reset();
        assert_eq!(conv.snapshot(), once.as_slice());
        assert_eq!(once, vec![Message::system("sys")]);
    }

    struct FailingEstimator;

    impl SizeEstimator for FailingEstimator {
        fn estimate(&self, _message: &Message) -> std::result::Result<usize, EstimateError> {
            Err(EstimateError::Failed("boom".to_string()))
        }
    }

    #[test]
    fn test_estimator_failure_collapses_to_system_and_last() {
        let mut conv = Conversation::new("sys", ConversationLimits::default());
        conv.append(Role::User, "one");
        conv.append(Role::Assistant, "two");
        let mut conv = conv.with_estimator(Box::new(FailingEstimator));
        let trim = conv.append(Role::User, "three");

        assert!(trim.fail_safe);
        let snapshot = conv.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].role, Role::System);
        assert_eq!(snapshot[1].content, "three");
        assert_eq!(conv.estimated_tokens(), None);
    }

    #[test]
    fn test_pop_last_if_respects_role_and_system() {
        let mut conv = Conversation::new("sys", ConversationLimits::default());
        assert!(conv.pop_last_if(Role::System).is_none());
        conv.append(Role::User, "q");
        assert!(conv.pop_last_if(Role::Assistant).is_none());
        assert_eq!(conv.pop_last_if(Role::User).map(|m| m.content), Some("q".to_string()));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_from_messages_rejects_missing_system() {
        let err = Conversation::from_messages(vec![Message::user("x")], small_limits())
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConversation(_)));

        let err = Conversation::from_messages(Vec::new(), small_limits()).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConversation(_)));
    }
}
