//! Prompt template retrieval.
//!
//! Templates live on a prompt server and are fetched by name. The
//! [`PromptLibrary`] owns the cache for one process (or one test) and is
//! handed to whoever needs templates; there is no global cache. When the
//! server cannot be reached the library answers with a built-in fallback so
//! the loop can still run, just with terser instructions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LlmError, LlmResult};

/// Named templates known to the prompt server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateName {
    SystemPrompt,
    GenerateStrategy,
    ModifyStrategy,
    FixStrategy,
    Results,
    Error,
}

impl TemplateName {
    pub const ALL: [TemplateName; 6] = [
        TemplateName::SystemPrompt,
        TemplateName::GenerateStrategy,
        TemplateName::ModifyStrategy,
        TemplateName::FixStrategy,
        TemplateName::Results,
        TemplateName::Error,
    ];

    /// Name used on the prompt server.
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateName::SystemPrompt => "SYSTEM_PROMPT",
            TemplateName::GenerateStrategy => "GENERATE_STRATEGY_TEMPLATE",
            TemplateName::ModifyStrategy => "MODIFY_STRATEGY_TEMPLATE",
            TemplateName::FixStrategy => "FIX_STRATEGY_TEMPLATE",
            TemplateName::Results => "RESULTS_PROMPT",
            TemplateName::Error => "ERROR_PROMPT",
        }
    }

    /// Built-in template used when the server is unavailable.
    pub fn fallback(&self) -> &'static str {
        match self {
            TemplateName::SystemPrompt => {
                "You are a professional quantitative trading assistant. You help users create, \
                 improve and backtest futures trading strategies. Always answer with one complete, \
                 runnable Python program inside a single ```python fenced block."
            }
            TemplateName::GenerateStrategy => {
                "Create a trading strategy for the backtesting framework that satisfies this \
                 request: {user_query}\nInstrument: {symbol}\nDate range: {start_date} to \
                 {end_date}\nBar period: {period}\nReturn the full program, including an \
                 `if __name__ == \"__main__\":` entry point that runs the backtest."
            }
            TemplateName::ModifyStrategy => {
                "Modify the following strategy:\n```python\n{current_strategy_code}\n```\n\
                 so that it satisfies this request: {modification_request}\nReturn the full \
                 updated program."
            }
            TemplateName::FixStrategy => {
                "The strategy failed while running. Error output:\n{error_info}\n\nCurrent \
                 code:\n```python\n{strategy_code}\n```\nFix the error and return the full \
                 corrected program."
            }
            TemplateName::Results => "Analyse these backtest results:\n{results}",
            TemplateName::Error => "Resolve this backtest error:\n{error}",
        }
    }
}

impl std::fmt::Display for TemplateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a template's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateOrigin {
    Remote,
    Cached,
    Fallback,
}

/// Result of a template lookup: the text plus whether it is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLookup {
    pub text: String,
    pub origin: TemplateOrigin,
}

impl TemplateLookup {
    /// `true` when the text came from the server (directly or via cache).
    pub fn is_authoritative(&self) -> bool {
        self.origin != TemplateOrigin::Fallback
    }
}

/// A source of prompt templates.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Fetch the current text of a template.
    async fn fetch(&self, name: TemplateName) -> LlmResult<String>;
}

/// Prompt server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptServerConfig {
    /// Prompt server base URL
    pub server_url: String,
    /// Key sent in the `X-API-Key` header
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PromptServerConfig {
    fn default() -> Self {
        PromptServerConfig {
            server_url: "http://127.0.0.1:5000".to_string(),
            api_key: "sk-demo-key".to_string(),
            timeout_secs: 5,
        }
    }
}

impl PromptServerConfig {
    /// Defaults overridden by `PROMPT_SERVER_URL` and `PROMPT_API_KEY`.
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    pub fn merge_env(mut self) -> Self {
        if let Ok(url) = std::env::var("PROMPT_SERVER_URL") {
            if !url.trim().is_empty() {
                self.server_url = url;
            }
        }
        if let Ok(key) = std::env::var("PROMPT_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = key;
            }
        }
        self
    }
}

#[derive(Deserialize)]
struct TemplateBody {
    content: Option<String>,
    error: Option<String>,
}

/// Fetches templates from `GET {server}/api/prompts/{NAME}`.
pub struct HttpTemplateSource {
    config: PromptServerConfig,
    http_client: reqwest::Client,
}

impl HttpTemplateSource {
    pub fn new(config: PromptServerConfig) -> LlmResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(HttpTemplateSource {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn fetch(&self, name: TemplateName) -> LlmResult<String> {
        let url = format!(
            "{}/api/prompts/{}",
            self.config.server_url.trim_end_matches('/'),
            name.as_str()
        );
        let response = self
            .http_client
            .get(&url)
            .header("X-API-Key", &self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        let body: TemplateBody = response.json().await.map_err(|err| LlmError::Template {
            name: name.to_string(),
            reason: format!("unreadable body (status {}): {}", status.as_u16(), err),
        })?;

        if !status.is_success() {
            return Err(LlmError::Template {
                name: name.to_string(),
                reason: format!(
                    "status {}: {}",
                    status.as_u16(),
                    body.error.unwrap_or_else(|| "unknown error".to_string())
                ),
            });
        }

        body.content.ok_or_else(|| LlmError::Template {
            name: name.to_string(),
            reason: "response has no content field".to_string(),
        })
    }
}

/// Template cache plus the source that fills it.
pub struct PromptLibrary {
    source: Option<Arc<dyn TemplateSource>>,
    cache: Mutex<HashMap<TemplateName, String>>,
}

impl PromptLibrary {
    pub fn new(source: Arc<dyn TemplateSource>) -> Self {
        PromptLibrary {
            source: Some(source),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A library that never contacts a server and always serves fallbacks.
    pub fn offline() -> Self {
        PromptLibrary {
            source: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a template: cache first, then the source, then the fallback.
    ///
    /// Fallbacks are not cached, so a server that comes back later is used.
    pub async fn get_template(&self, name: TemplateName) -> TemplateLookup {
        if let Some(text) = self.cached(name) {
            return TemplateLookup {
                text,
                origin: TemplateOrigin::Cached,
            };
        }

        if let Some(source) = &self.source {
            match source.fetch(name).await {
                Ok(text) => {
                    info!(template = %name, "loaded prompt template from server");
                    if let Ok(mut cache) = self.cache.lock() {
                        cache.insert(name, text.clone());
                    }
                    return TemplateLookup {
                        text,
                        origin: TemplateOrigin::Remote,
                    };
                }
                Err(err) => {
                    warn!(template = %name, error = %err, "prompt server unavailable, using fallback");
                }
            }
        } else {
            debug!(template = %name, "offline prompt library, using fallback");
        }

        TemplateLookup {
            text: name.fallback().to_string(),
            origin: TemplateOrigin::Fallback,
        }
    }

    /// Fetch a template and substitute its placeholders.
    pub async fn render(&self, name: TemplateName, values: &[(&str, &str)]) -> String {
        let lookup = self.get_template(name).await;
        render(&lookup.text, values)
    }

    /// Number of cached templates.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Drop every cached template.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn cached(&self, name: TemplateName) -> Option<String> {
        self.cache.lock().ok().and_then(|c| c.get(&name).cloned())
    }
}

/// Substitute `{key}` placeholders.
///
/// Each placeholder is replaced in a single left-to-right pass, so text
/// inserted for one key is never rescanned (code containing `{error}` stays
/// intact). Unknown placeholders and stray braces are left as-is.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close))
        });
        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
