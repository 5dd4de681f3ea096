use super::{AiProvider, ChatRequest, HttpContext, ProviderConfig, ProviderError};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4000;
const TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-3-5-haiku-latest".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

fn build_body(model: &str, request: &ChatRequest) -> MessagesRequest {
    // The system prompt is a top-level field; messages are user/assistant only.
    MessagesRequest {
        model: model.to_string(),
        max_tokens: MAX_TOKENS,
        temperature: TEMPERATURE,
        system: request.system_instruction.clone(),
        messages: request
            .turns()
            .into_iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: m.content,
            })
            .collect(),
    }
}

fn extract_text(response: MessagesResponse) -> Result<String, ProviderError> {
    if response.stop_reason.as_deref() == Some("refusal") {
        return Err(ProviderError::ContentBlocked("refusal".into()));
    }
    let text: String = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text.as_str())
        .collect();
    if text.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(text)
}

fn build_headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-api-key",
        HeaderValue::from_str(api_key)
            .map_err(|e| ProviderError::Misconfigured(format!("Invalid API key header value: {}", e)))?,
    );
    headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
    Ok(headers)
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    http: HttpContext,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig, http: HttpContext) -> Self {
        Self { config, http }
    }
}

impl AiProvider for AnthropicProvider {
    fn internal_name(&self) -> &'static str {
        "anthropic"
    }

    fn display_name(&self) -> &'static str {
        "Anthropic"
    }

    fn send(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        debug!(
            "Sending Anthropic request (model {}, key {})",
            self.config.model,
            super::masked_key(&self.config.api_key)
        );
        let builder = self
            .http
            .client()
            .post(MESSAGES_URL)
            .headers(build_headers(&self.config.api_key)?)
            .json(&build_body(&self.config.model, request));

        let response: MessagesResponse = self.http.post_json(builder, cancel)?;
        let text = extract_text(response)?;
        debug!("Anthropic response length: {}", text.len());
        Ok(text)
    }

    fn save_config(&self) -> ProviderConfig {
        ProviderConfig::Anthropic(self.config.clone())
    }
}
