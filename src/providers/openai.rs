//! OpenAI-compatible chat completions. Also serves Mistral, whose API is the
//! same shape at a different base URL.

use super::{AiProvider, ChatRequest, HttpContext, ProviderConfig, ProviderError};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
const TEMPERATURE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self::openai()
    }
}

impl OpenAiConfig {
    pub fn openai() -> Self {
        Self {
            api_key: String::new(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn mistral() -> Self {
        Self {
            api_key: String::new(),
            base_url: MISTRAL_BASE_URL.to_string(),
            model: "mistral-small-latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    OpenAi,
    Mistral,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

fn build_body(model: &str, request: &ChatRequest) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: request
            .messages_with_system()
            .into_iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: m.content,
            })
            .collect(),
        temperature: TEMPERATURE,
        stream: false,
    }
}

fn extract_text(response: ChatCompletionResponse) -> Result<String, ProviderError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(ProviderError::EmptyResponse);
    };
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ProviderError::ContentBlocked("content_filter".into()));
    }
    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(ProviderError::EmptyResponse),
    }
}

fn build_headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if !api_key.is_empty() {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| {
                ProviderError::Misconfigured(format!("Invalid authorization header value: {}", e))
            })?,
        );
    }
    Ok(headers)
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    http: HttpContext,
    flavor: Flavor,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig, http: HttpContext, flavor: Flavor) -> Self {
        Self {
            config,
            http,
            flavor,
        }
    }
}

impl AiProvider for OpenAiProvider {
    fn internal_name(&self) -> &'static str {
        match self.flavor {
            Flavor::OpenAi => "openai",
            Flavor::Mistral => "mistral",
        }
    }

    fn display_name(&self) -> &'static str {
        match self.flavor {
            Flavor::OpenAi => "OpenAI Compatible",
            Flavor::Mistral => "Mistral",
        }
    }

    fn send(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(
            "Sending chat completion to {} (model {}, key {})",
            url,
            self.config.model,
            super::masked_key(&self.config.api_key)
        );

        let body = build_body(&self.config.model, request);
        let builder = self
            .http
            .client()
            .post(&url)
            .headers(build_headers(&self.config.api_key)?)
            .json(&body);

        let response: ChatCompletionResponse = self.http.post_json(builder, cancel)?;
        extract_text(response)
    }

    fn save_config(&self) -> ProviderConfig {
        match self.flavor {
            Flavor::OpenAi => ProviderConfig::OpenAiCompatible(self.config.clone()),
            Flavor::Mistral => ProviderConfig::Mistral(self.config.clone()),
        }
    }
}
