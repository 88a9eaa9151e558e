//! Chat-completion client used for RFP structuring and proposal extraction.
//!
//! Configuration:
//! - `LLM_PROVIDER`: `openai` or `gemini` (default: `openai` when `OPENAI_API_KEY` is set, else `gemini`)
//! - `OPENAI_API_KEY` / `OPENAI_API_URL` (default: `https://api.openai.com/v1`)
//! - `GEMINI_API_KEY` / `GEMINI_API_URL` (default: `https://generativelanguage.googleapis.com`)
//! - `LLM_MODEL`: model name (default: `gpt-4o-mini` / `gemini-2.0-flash`)
//! - `LLM_TIMEOUT_SECS`: per-request timeout (default: 30)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing api key for {0}")]
    MissingApiKey(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} returned {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("empty completion")]
    EmptyCompletion,
    #[error("llm call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the model's text completion for a system prompt plus user text.
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
}

impl LlmProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAI),
            "gemini" | "google" => Some(LlmProvider::Gemini),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "openai",
            LlmProvider::Gemini => "gemini",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => DEFAULT_OPENAI_MODEL,
            LlmProvider::Gemini => DEFAULT_GEMINI_MODEL,
        }
    }

    pub fn default_api_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => DEFAULT_OPENAI_URL,
            LlmProvider::Gemini => DEFAULT_GEMINI_URL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    config: LlmConfig,
    client: Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.as_deref().map_or(true, |key| key.trim().is_empty()) {
            return Err(LlmError::MissingApiKey(config.provider.label()));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        info!(
            "llm client initialized: provider={}, model={}",
            config.provider.label(),
            config.model
        );
        Ok(Self { config, client })
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey(self.config.provider.label()))
    }

    async fn call_openai(&self, system_prompt: &str, user_text: &str) -> Result<String, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        let request = OpenAIChatRequest {
            model: &self.config.model,
            messages: vec![
                OpenAIChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OpenAIChatMessage {
                    role: "user".to_string(),
                    content: user_text.to_string(),
                },
            ],
            temperature: 0.0,
        };

        debug!("calling openai {} with model {}", url, self.config.model);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key()?)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: "openai",
                status,
                body,
            });
        }

        let parsed: OpenAIChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyCompletion)
    }

    async fn call_gemini(&self, system_prompt: &str, user_text: &str) -> Result<String, LlmError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.api_url.trim_end_matches('/'),
            self.config.model
        );
        let request = GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: system_prompt.to_string(),
                }],
            },
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: user_text.to_string(),
                }],
            }],
        };

        debug!("calling gemini model {}", self.config.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key()?)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: "gemini",
                status,
                body,
            });
        }

        let parsed: GeminiResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<String, LlmError> {
        match self.config.provider {
            LlmProvider::OpenAI => self.call_openai(system_prompt, user_text).await,
            LlmProvider::Gemini => self.call_gemini(system_prompt, user_text).await,
        }
    }
}

/// Runs `complete` under a hard deadline on top of the HTTP timeout.
pub async fn complete_with_timeout(
    client: &dyn LlmClient,
    system_prompt: &str,
    user_text: &str,
    timeout: Duration,
) -> Result<String, LlmError> {
    tokio::time::timeout(timeout, client.complete(system_prompt, user_text))
        .await
        .map_err(|_| LlmError::Timeout(timeout))?
}

// ============================================================================
// OpenAI API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIChatMessage>,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChatChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatChoice {
    message: OpenAIChatMessage,
}

// ============================================================================
// Gemini API types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}
