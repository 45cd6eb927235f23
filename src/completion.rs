//! Chat-completion provider strategy.
//!
//! Three interchangeable backends sit behind [`CompletionProvider`]:
//! DeepSeek and OpenAI share the OpenAI-compatible wire shape, Anthropic has
//! its own. The active provider is chosen once at startup by which API key
//! environment variable is present, cheapest first (DeepSeek → Anthropic →
//! OpenAI) — never per call site.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::CompletionConfig;

/// A chat message on the completion wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Completion result with token accounting for the usage ledger.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("no completion provider configured: {0}")]
    NotConfigured(String),
}

impl CompletionError {
    /// Client errors other than 429 are the caller's fault; retrying them
    /// burns attempts for nothing.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Api { status, .. } => *status == 429 || *status >= 500,
            CompletionError::Http(_) => true,
            _ => false,
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, CompletionError>;
}

// ============ OpenAI-compatible (DeepSeek, OpenAI) ============

pub struct OpenAiCompatProvider {
    name: String,
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: &str,
        url: &str,
        api_key: String,
        model: String,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            url: url.to_string(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, CompletionError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        debug!(provider = %self.name, url = %self.url, "completion request");

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api { status, body });
        }

        let resp: serde_json::Value = response.json().await?;
        let text = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                CompletionError::Parse("missing choices[0].message.content".into())
            })?
            .to_string();
        let input_tokens = resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = resp["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

// ============ Anthropic ============

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, CompletionError> {
        // The Anthropic API takes the system prompt as a separate parameter.
        let system_msg = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => unreachable!(),
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if let Some(system) = system_msg {
            body["system"] = json!(system);
        }

        debug!(provider = "anthropic", "completion request");

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api { status, body });
        }

        let resp: serde_json::Value = response.json().await?;
        let text = resp["content"][0]["text"]
            .as_str()
            .ok_or_else(|| CompletionError::Parse("missing content[0].text".into()))?
            .to_string();
        let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

// ============ Provider selection ============

/// Select the completion backend from the environment, cheapest first.
pub fn select_provider(
    config: &CompletionConfig,
) -> Result<Arc<dyn CompletionProvider>, CompletionError> {
    select_provider_from(config, |name| std::env::var(name).ok())
}

/// Selection core, parameterized over the key lookup for testability.
pub fn select_provider_from(
    config: &CompletionConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn CompletionProvider>, CompletionError> {
    if let Some(key) = lookup("DEEPSEEK_API_KEY") {
        return Ok(Arc::new(OpenAiCompatProvider::new(
            "deepseek",
            "https://api.deepseek.com/v1/chat/completions",
            key,
            config.deepseek_model.clone(),
            config.timeout_secs,
        )));
    }
    if let Some(key) = lookup("ANTHROPIC_API_KEY") {
        return Ok(Arc::new(AnthropicProvider::new(
            key,
            config.anthropic_model.clone(),
            config.timeout_secs,
        )));
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        return Ok(Arc::new(OpenAiCompatProvider::new(
            "openai",
            "https://api.openai.com/v1/chat/completions",
            key,
            config.openai_model.clone(),
            config.timeout_secs,
        )));
    }
    Err(CompletionError::NotConfigured(
        "set DEEPSEEK_API_KEY, ANTHROPIC_API_KEY, or OPENAI_API_KEY".to_string(),
    ))
}

/// Call the provider with up to `max_attempts` tries, exponential backoff
/// (1s base, doubling). Non-retryable errors abandon immediately.
pub async fn complete_with_retry(
    provider: &dyn CompletionProvider,
    messages: &[Message],
    max_tokens: u32,
    temperature: f32,
    max_attempts: u32,
) -> Result<Completion, CompletionError> {
    let attempts = max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
        }
        match provider.complete(messages, max_tokens, temperature).await {
            Ok(c) => return Ok(c),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| CompletionError::Parse("retry loop exhausted without error".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lookup_from<'a>(
        map: &'a HashMap<&'a str, &'a str>,
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn selection_prefers_deepseek() {
        let cfg = CompletionConfig::default();
        let keys: HashMap<&str, &str> = [
            ("DEEPSEEK_API_KEY", "a"),
            ("ANTHROPIC_API_KEY", "b"),
            ("OPENAI_API_KEY", "c"),
        ]
        .into_iter()
        .collect();
        let provider = select_provider_from(&cfg, lookup_from(&keys)).unwrap();
        assert_eq!(provider.name(), "deepseek");
    }

    #[test]
    fn selection_falls_back_in_priority_order() {
        let cfg = CompletionConfig::default();

        let keys: HashMap<&str, &str> = [("ANTHROPIC_API_KEY", "b"), ("OPENAI_API_KEY", "c")]
            .into_iter()
            .collect();
        let provider = select_provider_from(&cfg, lookup_from(&keys)).unwrap();
        assert_eq!(provider.name(), "anthropic");

        let keys: HashMap<&str, &str> = [("OPENAI_API_KEY", "c")].into_iter().collect();
        let provider = select_provider_from(&cfg, lookup_from(&keys)).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn selection_fails_without_any_key() {
        let cfg = CompletionConfig::default();
        match select_provider_from(&cfg, |_| None) {
            Ok(provider) => panic!("expected NotConfigured, got provider {}", provider.name()),
            Err(err) => assert!(matches!(err, CompletionError::NotConfigured(_))),
        }
    }

    /// Provider scripted to fail N times before succeeding.
    struct FlakyProvider {
        failures: usize,
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<Completion, CompletionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CompletionError::Api {
                    status: self.status,
                    body: "scripted failure".to_string(),
                });
            }
            Ok(Completion {
                text: "ok".to_string(),
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_server_errors() {
        let provider = FlakyProvider {
            failures: 2,
            status: 500,
            calls: AtomicUsize::new(0),
        };
        let out = complete_with_retry(&provider, &[], 64, 0.0, 3).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_abandons_on_client_error() {
        let provider = FlakyProvider {
            failures: 10,
            status: 400,
            calls: AtomicUsize::new(0),
        };
        let err = complete_with_retry(&provider, &[], 64, 0.0, 3).await.unwrap_err();
        assert!(matches!(err, CompletionError::Api { status: 400, .. }));
        // 4xx is not retried.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_attempts() {
        let provider = FlakyProvider {
            failures: 10,
            status: 503,
            calls: AtomicUsize::new(0),
        };
        let err = complete_with_retry(&provider, &[], 64, 0.0, 3).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retryability_classification() {
        assert!(CompletionError::Api {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(CompletionError::Api {
            status: 502,
            body: String::new()
        }
        .is_retryable());
        assert!(!CompletionError::Api {
            status: 401,
            body: String::new()
        }
        .is_retryable());
        assert!(!CompletionError::Parse("x".into()).is_retryable());
    }
}
