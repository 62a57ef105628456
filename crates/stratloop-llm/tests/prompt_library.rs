//! Prompt library caching and fallback behaviour.

use std::sync::Arc;

use stratloop_llm::fakes::StaticTemplateSource;
use stratloop_llm::{PromptLibrary, TemplateName, TemplateOrigin};

#[tokio::test]
async fn remote_template_is_cached_after_first_fetch() {
    let source = Arc::new(
        StaticTemplateSource::new().with(TemplateName::SystemPrompt, "You write strategies."),
    );
    let library = PromptLibrary::new(source.clone());

    let first = library.get_template(TemplateName::SystemPrompt).await;
    assert_eq!(first.origin, TemplateOrigin::Remote);
    assert_eq!(first.text, "You write strategies.");

    let second = library.get_template(TemplateName::SystemPrompt).await;
    assert_eq!(second.origin, TemplateOrigin::Cached);
    assert_eq!(second.text, first.text);

    assert_eq!(source.fetch_count(), 1);
    assert_eq!(library.cached_len(), 1);
}

#[tokio::test]
async fn missing_template_falls_back_and_is_retried() {
    let source = Arc::new(StaticTemplateSource::new());
    let library = PromptLibrary::new(source.clone());

    let first = library.get_template(TemplateName::Results).await;
    assert_eq!(first.origin, TemplateOrigin::Fallback);
    assert_eq!(first.text, TemplateName::Results.fallback());

    // fallbacks are not cached: the source is asked again
    let _ = library.get_template(TemplateName::Results).await;
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(library.cached_len(), 0);
}

#[tokio::test]
async fn render_uses_remote_template_text() {
    let source = Arc::new(StaticTemplateSource::new().with(
        TemplateName::GenerateStrategy,
        "Q={user_query} S={symbol} {start_date}..{end_date} P={period}",
    ));
    let library = PromptLibrary::new(source);

    let prompt = library
        .render(
            TemplateName::GenerateStrategy,
            &[
                ("user_query", "5/20 crossover"),
                ("symbol", "rb888"),
                ("start_date", "2024-01-01"),
                ("end_date", "2024-12-31"),
                ("period", "1d"),
            ],
        )
        .await;

    assert_eq!(prompt, "Q=5/20 crossover S=rb888 2024-01-01..2024-12-31 P=1d");
}

#[tokio::test]
async fn clear_cache_forces_refetch() {
    let source = Arc::new(StaticTemplateSource::new().with(TemplateName::Error, "E: {error}"));
    let library = PromptLibrary::new(source.clone());

    let _ = library.get_template(TemplateName::Error).await;
    library.clear_cache();
    let lookup = library.get_template(TemplateName::Error).await;

    assert_eq!(lookup.origin, TemplateOrigin::Remote);
    assert_eq!(source.fetch_count(), 2);
}
