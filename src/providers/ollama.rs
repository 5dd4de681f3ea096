use super::{AiProvider, ChatRequest, HttpContext, ProviderConfig, ProviderError};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    /// Minutes to keep the model loaded, or any Ollama duration string.
    pub keep_alive: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            keep_alive: "5".to_string(),
        }
    }
}

impl OllamaConfig {
    /// Bare numbers are minutes; anything else is passed through.
    fn keep_alive_param(&self) -> Option<String> {
        let value = self.keep_alive.trim();
        if value.is_empty() {
            return None;
        }
        if value.chars().all(|c| c.is_ascii_digit()) {
            Some(format!("{}m", value))
        } else {
            Some(value.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

fn build_body(config: &OllamaConfig, request: &ChatRequest) -> ChatBody {
    ChatBody {
        model: config.model.clone(),
        messages: request
            .messages_with_system()
            .into_iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: m.content,
            })
            .collect(),
        stream: false,
        keep_alive: config.keep_alive_param(),
    }
}

pub struct OllamaProvider {
    config: OllamaConfig,
    http: HttpContext,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig, http: HttpContext) -> Self {
        Self { config, http }
    }
}

impl AiProvider for OllamaProvider {
    fn internal_name(&self) -> &'static str {
        "ollama"
    }

    fn display_name(&self) -> &'static str {
        "Ollama"
    }

    fn send(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        debug!("Ollama using model '{}' at {}", self.config.model, url);

        let builder = self
            .http
            .client()
            .post(&url)
            .json(&build_body(&self.config, request));
        let response: ChatResponse = self.http.post_json(builder, cancel)?;

        match response.message {
            Some(message) if !message.content.trim().is_empty() => {
                Ok(message.content.trim().to_string())
            }
            _ => Err(ProviderError::EmptyResponse),
        }
    }

    fn save_config(&self) -> ProviderConfig {
        ProviderConfig::Ollama(self.config.clone())
    }
}
