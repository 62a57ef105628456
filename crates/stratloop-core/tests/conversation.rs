use stratloop_core::{
    CharRatioEstimator, Conversation, ConversationLimits, ForgeError, Message, Role,
    SizeEstimator,
};
use tempfile::tempdir;

fn limits(safe: usize, warning: usize) -> ConversationLimits {
    ConversationLimits {
        safe_tokens: safe,
        warning_tokens: warning,
        truncate_ratio: 0.7,
    }
}

fn total(conv: &Conversation) -> usize {
    let estimator = CharRatioEstimator::default();
    conv.snapshot()
        .iter()
        .map(|m| estimator.estimate(m).unwrap())
        .sum()
}

#[test]
fn system_message_stays_first_through_any_append_sequence() {
    let mut conv = Conversation::new("system prompt", limits(200, 260));
    let sizes = [10usize, 300, 50, 900, 1, 120, 400, 0, 77, 2000];
    for (i, size) in sizes.iter().enumerate() {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        conv.append(role, "x".repeat(*size));

        let snapshot = conv.snapshot();
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot[0].role, Role::System);
        assert_eq!(snapshot[0].content, "system prompt");
    }
}

#[test]
fn size_is_bounded_or_minimal_after_every_append() {
    let mut conv = Conversation::new("s", limits(100, 130));
    for size in [30usize, 90, 150, 600, 40, 40, 40, 40, 500, 10] {
        conv.append(Role::User, "y".repeat(size));
        assert!(
            total(&conv) <= 100 || conv.len() == 2,
            "total {} with {} messages",
            total(&conv),
            conv.len()
        );
    }
}

#[test]
fn newest_message_always_survives_trimming() {
    let mut conv = Conversation::new("s", limits(100, 130));
    for i in 0..20 {
        conv.append(Role::User, format!("{}{}", i, "z".repeat(60)));
        let last = conv.snapshot().last().unwrap();
        assert!(last.content.starts_with(&i.to_string()));
    }
}

#[test]
fn save_then_load_round_trips_exactly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("history").join("conv.json");

    let mut conv = Conversation::new("你是量化交易助手", ConversationLimits::default());
    conv.append(Role::User, "生成双均线策略");
    conv.append(Role::Assistant, "```python\nprint(\"ok\")\n```");
    conv.save(&path).unwrap();

    let loaded = Conversation::load(&path, ConversationLimits::default()).unwrap();
    assert_eq!(loaded.snapshot(), conv.snapshot());
}

#[test]
fn loading_history_without_system_first_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    let messages = vec![Message::user("hi"), Message::system("late")];
    std::fs::write(&path, serde_json::to_string(&messages).unwrap()).unwrap();

    let err = Conversation::load(&path, ConversationLimits::default()).unwrap_err();
    assert!(matches!(err, ForgeError::InvalidConversation(_)));
}

#[test]
fn reset_is_idempotent() {
    let mut conv = Conversation::new("sys", ConversationLimits::default());
    conv.append(Role::User, "a 5/20 crossover please");
    conv.append(Role::Assistant, "```python\nprint(1)\n```");

    conv.reset();
    let once = conv.snapshot().to_vec();
    conv.reset();

    assert_eq!(conv.snapshot(), once.as_slice());
    assert_eq!(once, vec![Message::system("sys")]);
}
