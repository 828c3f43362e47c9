use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::extract::ExtractError;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("no API key provided; set GEMINI_API_KEY or pass --api-key")]
    MissingApiKey,
    #[error("rate limited by the completion endpoint (429): {0}")]
    RateLimited(String),
    #[error("completion request failed with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to reach the completion endpoint")]
    Transport(#[from] reqwest::Error),
    #[error("completion endpoint returned no text")]
    EmptyResponse,
    #[error(transparent)]
    Format(#[from] ExtractError),
    #[error("input text is empty")]
    EmptyInput,
    #[error("{0}")]
    Invalid(String),
}

impl AiError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AiError::RateLimited(_))
    }
}

/// Sampling parameters sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: None,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// Base64 payload with its mime type, e.g. a rendered page image.
    InlineData { mime_type: String, data: String },
}

impl Part {
    fn to_json(&self) -> Value {
        match self {
            Part::Text(text) => json!({ "text": text }),
            Part::InlineData { mime_type, data } => json!({
                "inline_data": { "mime_type": mime_type, "data": data }
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub parts: Vec<Part>,
    pub config: GenerationConfig,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>, config: GenerationConfig) -> Self {
        Self {
            parts: vec![Part::Text(prompt.into())],
            config,
        }
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Concatenated text parts; handy for logging and test doubles.
    pub fn prompt_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                Part::InlineData { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Anything that turns a prompt into free-form text.
pub trait CompletionBackend {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<String, AiError>> + Send;
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            model: std::env::var("STUDYHUB_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_url: std::env::var("STUDYHUB_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
        }
    }

    /// Applies command-line overrides on top of the environment.
    pub fn with_overrides(
        mut self,
        api_key: Option<String>,
        model: Option<String>,
        api_url: Option<String>,
    ) -> Self {
        if api_key.is_some() {
            self.api_key = api_key;
        }
        if let Some(model) = model {
            self.model = model;
        }
        if let Some(url) = api_url {
            self.api_url = url;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
}

impl GeminiClient {
    pub fn new(config: &AiConfig) -> Result<Self, AiError> {
        let api_key = config.api_key.clone().ok_or(AiError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            api_key,
            model: config.model.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_url, self.model)
    }

    fn request_body(request: &CompletionRequest) -> Value {
        json!({
            "contents": [{
                "parts": request.parts.iter().map(Part::to_json).collect::<Vec<_>>()
            }],
            "generationConfig": request.config,
        })
    }
}

impl CompletionBackend for GeminiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .header("Content-Type", "application/json")
            .json(&Self::request_body(request))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::RateLimited(message));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        response_text(&body).map_err(|err| {
            tracing::warn!(error = %err, "unexpected completion response shape");
            AiError::EmptyResponse
        })
    }
}

/// Joins the text parts of the first candidate.
fn response_text(body: &Value) -> anyhow::Result<String> {
    let parts = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("Unexpected Gemini API response format"))?;

    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(anyhow!("Gemini response contained no text parts"));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_generation_config() {
        let request = CompletionRequest::text("hello", GenerationConfig::default().with_max_tokens(2048))
            .with_part(Part::InlineData {
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            });
        let body = GeminiClient::request_body(&request);

        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["contents"][0]["parts"][1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(body["generationConfig"]["topK"], 40);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn max_tokens_omitted_when_unset() {
        let body = GeminiClient::request_body(&CompletionRequest::text("x", GenerationConfig::default()));
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn response_text_joins_parts() {
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": "[1," }, { "text": "2]" }] } }]
        });
        assert_eq!(response_text(&body).unwrap(), "[1,2]");
        assert!(response_text(&json!({ "candidates": [] })).is_err());
    }

    #[test]
    fn client_requires_api_key() {
        let config = AiConfig {
            api_key: None,
            model: DEFAULT_MODEL.into(),
            api_url: DEFAULT_API_URL.into(),
        };
        assert!(matches!(GeminiClient::new(&config), Err(AiError::MissingApiKey)));
    }
}
