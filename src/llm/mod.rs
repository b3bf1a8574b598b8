use std::{env, fmt, time::Duration};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::Deserialize;
use thiserror::Error;

/// Enumerates the supported LLM backends behind the shared utility.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LlmProvider {
    OpenAi,
    OpenRouter,
}

impl LlmProvider {
    fn endpoint(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1/chat/completions",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::OpenRouter => write!(f, "openrouter"),
        }
    }
}

/// Captures basic token usage metrics associated with a call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub response_tokens: usize,
    pub total_tokens: usize,
}

/// Generated text for a single prompt.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub token_usage: TokenUsage,
}

/// Failure modes of a single generation call.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The provider asked us to slow down, optionally saying for how long.
    #[error("provider throttled the request")]
    Throttled { retry_after: Option<Duration> },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Anything that can turn a prompt into text. The pipeline only talks to this seam.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Completion, GenerationError>;
}

/// Main entry point for invoking providers.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
    model: String,
    max_output_tokens: u32,
}

#[derive(Clone, Default)]
struct LlmConfig {
    openai_api_key: Option<String>,
    openrouter_api_key: Option<String>,
    openrouter_referer: Option<String>,
    openrouter_title: Option<String>,
}

impl LlmClient {
    /// Build a client using environment variables for credentials.
    pub fn from_env(model: impl Into<String>, max_output_tokens: u32) -> anyhow::Result<Self> {
        let model = model.into();
        parse_model_provider(&model)?;

        Ok(Self {
            http: Client::new(),
            config: LlmConfig {
                openai_api_key: env::var("OPENAI_API_KEY").ok(),
                openrouter_api_key: env::var("OPENROUTER_API_KEY").ok(),
                openrouter_referer: env::var("OPENROUTER_HTTP_REFERER").ok(),
                openrouter_title: env::var("OPENROUTER_X_TITLE").ok(),
            },
            model,
            max_output_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_key(&self, provider: LlmProvider) -> anyhow::Result<&str> {
        let key = match provider {
            LlmProvider::OpenAi => self.config.openai_api_key.as_deref(),
            LlmProvider::OpenRouter => self.config.openrouter_api_key.as_deref(),
        };
        match (provider, key) {
            (_, Some(key)) => Ok(key),
            (LlmProvider::OpenAi, None) => {
                bail!("OPENAI_API_KEY is not configured but required for OpenAI requests")
            }
            (LlmProvider::OpenRouter, None) => {
                bail!("OPENROUTER_API_KEY is not configured but required for OpenRouter requests")
            }
        }
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, GenerationError> {
        let (provider, provider_model) = parse_model_provider(&self.model)?;
        let api_key = self.api_key(provider)?;

        let payload = serde_json::json!({
            "model": provider_model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_output_tokens,
            "n": 1,
        });

        let mut req_builder = self
            .http
            .post(provider.endpoint())
            .bearer_auth(api_key)
            .json(&payload);

        if provider == LlmProvider::OpenRouter {
            if let Some(referer) = &self.config.openrouter_referer {
                req_builder = req_builder.header("HTTP-Referer", referer);
            }
            if let Some(title) = &self.config.openrouter_title {
                req_builder = req_builder.header("X-Title", title);
            }
        }

        let response = req_builder
            .send()
            .await
            .with_context(|| format!("{provider} request could not be sent"))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::Throttled {
                retry_after: parse_retry_after(response.headers()),
            });
        }

        let response_text = response
            .text()
            .await
            .context("failed to read response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "{provider} call failed with status {}: {}",
                status,
                preview(&response_text)
            )
            .into());
        }

        let body: serde_json::Value = serde_json::from_str(&response_text).with_context(|| {
            format!(
                "failed to parse {provider} response as JSON. Response body: {}",
                preview(&response_text)
            )
        })?;

        let (text, usage) = extract_text_and_usage(&body)
            .ok_or_else(|| anyhow!("unexpected {provider} response payload: {}", body))?;

        let prompt_tokens = approximate_token_count(prompt);
        let mut token_usage = usage.unwrap_or_default();
        if token_usage.prompt_tokens == 0 {
            token_usage.prompt_tokens = prompt_tokens;
        }
        if token_usage.response_tokens == 0 {
            token_usage.response_tokens = approximate_token_count(&text);
        }
        token_usage.total_tokens = token_usage.prompt_tokens + token_usage.response_tokens;

        Ok(Completion { text, token_usage })
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<Completion, GenerationError> {
        self.complete(prompt).await
    }
}

fn preview(body: &str) -> String {
    if body.chars().count() > 500 {
        let head: String = body.chars().take(500).collect();
        format!("{head}...")
    } else {
        body.to_string()
    }
}

/// Reads the wait hint from a 429 response. `retry-after-ms` wins over `retry-after`.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
    };

    if let Some(ms) = header_value("retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
        if ms.is_finite() && ms >= 0.0 {
            return Some(Duration::from_secs_f64(ms / 1000.0));
        }
    }

    header_value("retry-after")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Extract assistant text and optional usage from chat or legacy completion payloads.
fn extract_text_and_usage(value: &serde_json::Value) -> Option<(String, Option<TokenUsage>)> {
    let payload = serde_json::from_value::<CompletionPayload>(value.clone()).ok()?;

    let text = payload.choices.into_iter().find_map(|choice| {
        choice
            .message
            .and_then(|message| message.content)
            .or(choice.text)
    })?;

    let usage = payload.usage.map(|usage| TokenUsage {
        prompt_tokens: usage.prompt_tokens.unwrap_or_default(),
        response_tokens: usage.completion_tokens.unwrap_or_default(),
        total_tokens: usage.total_tokens.unwrap_or_default(),
    });

    Some((text.trim().to_string(), usage))
}

fn parse_model_provider(model: &str) -> anyhow::Result<(LlmProvider, &str)> {
    let (provider, name) = model.split_once('/').ok_or_else(|| {
        anyhow!("model must be prefixed with provider, e.g. 'openai/gpt-4o-mini'")
    })?;

    if name.trim().is_empty() {
        bail!("model name is required after provider prefix");
    }

    match provider {
        "openai" => Ok((LlmProvider::OpenAi, name)),
        "openrouter" => Ok((LlmProvider::OpenRouter, name)),
        other => bail!("unsupported provider prefix: {other}"),
    }
}

pub fn approximate_token_count(input: &str) -> usize {
    if input.trim().is_empty() {
        return 0;
    }
    input
        .split_whitespace()
        .filter(|segment| !segment.is_empty())
        .count()
}

#[derive(Debug, Deserialize)]
struct CompletionPayload {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<ChatMessagePayload>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessagePayload {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}
