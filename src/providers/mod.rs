//! AI provider adapters behind one request/cancel contract.
//!
//! Every adapter exposes a blocking `send` that is run on a per-request worker
//! thread and returns `Result<String, ProviderError>`. Cancellation is a
//! `CancellationToken` checked before the network call and again before the
//! result is handed back; the HTTP adapters also race the call against the
//! token so a superseded request stops waiting on the network.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use crate::conversation::{ChatMessage, Role};
use crate::frontend::Notification;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT_SECS: u64 = 10;
/// Longest slice of a vendor error body kept in messages.
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("content blocked: {0}")]
    ContentBlocked(String),
    #[error("provider returned an empty response")]
    EmptyResponse,
    #[error("provider error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("provider not configured: {0}")]
    Misconfigured(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Classifies a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_error_message(body);
        let lowered = message.to_lowercase();

        if body.contains("API_KEY_INVALID") || lowered.contains("invalid api key") {
            return ProviderError::Auth(message);
        }
        match status {
            401 | 403 => ProviderError::Auth(message),
            402 => ProviderError::QuotaExceeded(message),
            429 if lowered.contains("quota") || lowered.contains("resource_exhausted") => {
                ProviderError::QuotaExceeded(message)
            }
            429 => ProviderError::RateLimited(message),
            404 if lowered.contains("model") => ProviderError::Misconfigured(message),
            _ => ProviderError::Api { status, message },
        }
    }

    /// Message box for this failure. Cancellations are silent.
    pub fn notification(&self, provider: &str) -> Option<Notification> {
        let (title, message) = match self {
            ProviderError::Cancelled => return None,
            ProviderError::Auth(detail) => (
                "Invalid API Key",
                format!("Your {provider} API key was rejected. Please check it in Settings.\n\n{detail}"),
            ),
            ProviderError::RateLimited(_) => (
                "Rate Limit Hit",
                "You're sending requests too quickly. Please wait a moment and try again.".to_string(),
            ),
            ProviderError::QuotaExceeded(_) => (
                "Quota Exceeded",
                format!("You've exceeded your {provider} quota. Please check your usage limits or try again later."),
            ),
            ProviderError::Network(detail) => (
                "Connection Error",
                format!("Cannot reach {provider}. Check your network and the server URL in Settings.\n\n{detail}"),
            ),
            ProviderError::ContentBlocked(reason) => (
                "Content Blocked",
                format!("{provider} refused to process this text ({reason})."),
            ),
            ProviderError::EmptyResponse => (
                "Empty Response",
                format!("{provider} returned an empty response. This might be due to insufficient credits or API limits."),
            ),
            ProviderError::Misconfigured(detail) => (
                "Settings Required",
                format!("{detail}\n\nPlease complete the {provider} configuration in Settings."),
            ),
            ProviderError::Api { status, message } => (
                "API Error",
                format!("An error occurred with {provider} (HTTP {status}):\n\n{message}"),
            ),
        };
        Some(Notification::new(title, message))
    }
}

/// Pulls a human-readable message out of a vendor error body.
fn extract_error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .map(str::to_string)
        });

    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.chars().count() > ERROR_BODY_LIMIT {
        let cut: String = message.chars().take(ERROR_BODY_LIMIT).collect();
        format!("{}...", cut)
    } else {
        message
    }
}

/// Key rendering for logs: the last four characters only.
pub(crate) fn masked_key(key: &str) -> String {
    let count = key.chars().count();
    if count == 0 {
        return "<unset>".to_string();
    }
    if count <= 8 {
        return "****".to_string();
    }
    let tail: String = key.chars().skip(count - 4).collect();
    format!("****{}", tail)
}

/// What to send: a single prompt, or a whole transcript for follow-ups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    Transcript(Vec<ChatMessage>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub system_instruction: String,
    pub prompt: Prompt,
}

impl ChatRequest {
    pub fn single(system_instruction: &str, prompt: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.to_string(),
            prompt: Prompt::Text(prompt.into()),
        }
    }

    pub fn transcript(system_instruction: &str, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_instruction: system_instruction.to_string(),
            prompt: Prompt::Transcript(messages),
        }
    }

    /// The conversation turns (no system message), oldest first.
    pub fn turns(&self) -> Vec<ChatMessage> {
        match &self.prompt {
            Prompt::Text(text) => vec![ChatMessage::user(text.clone())],
            Prompt::Transcript(messages) => messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned()
                .collect(),
        }
    }

    /// System message followed by the turns, for chat-completion style APIs.
    pub fn messages_with_system(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if !self.system_instruction.trim().is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: self.system_instruction.clone(),
            });
        }
        messages.extend(self.turns());
        messages
    }
}

/// Per-provider settings. Each variant is validated when loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Gemini(gemini::GeminiConfig),
    OpenAiCompatible(openai::OpenAiConfig),
    Ollama(ollama::OllamaConfig),
    Anthropic(anthropic::AnthropicConfig),
    Mistral(openai::OpenAiConfig),
}

impl ProviderConfig {
    pub fn internal_name(&self) -> &'static str {
        match self {
            ProviderConfig::Gemini(_) => "gemini",
            ProviderConfig::OpenAiCompatible(_) => "openai",
            ProviderConfig::Ollama(_) => "ollama",
            ProviderConfig::Anthropic(_) => "anthropic",
            ProviderConfig::Mistral(_) => "mistral",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderConfig::Gemini(_) => "Gemini",
            ProviderConfig::OpenAiCompatible(_) => "OpenAI Compatible",
            ProviderConfig::Ollama(_) => "Ollama",
            ProviderConfig::Anthropic(_) => "Anthropic",
            ProviderConfig::Mistral(_) => "Mistral",
        }
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        let name = self.display_name();
        let (api_key, model, base_url) = match self {
            ProviderConfig::Gemini(c) => (Some(&c.api_key), &c.model, None),
            ProviderConfig::OpenAiCompatible(c) | ProviderConfig::Mistral(c) => {
                (Some(&c.api_key), &c.model, Some(&c.base_url))
            }
            ProviderConfig::Ollama(c) => (None, &c.model, Some(&c.base_url)),
            ProviderConfig::Anthropic(c) => (Some(&c.api_key), &c.model, None),
        };

        if api_key.is_some_and(|k| k.trim().is_empty()) {
            return Err(ProviderError::Misconfigured(format!("{name} API key is not set.")));
        }
        if model.trim().is_empty() {
            return Err(ProviderError::Misconfigured(format!("No {name} model selected.")));
        }
        if let Some(url) = base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ProviderError::Misconfigured(format!(
                    "{name} server URL must start with http:// or https:// (got '{url}')."
                )));
            }
        }
        Ok(())
    }

    /// The full set of providers with default settings.
    pub fn defaults() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig::Gemini(gemini::GeminiConfig::default()),
            ProviderConfig::OpenAiCompatible(openai::OpenAiConfig::openai()),
            ProviderConfig::Ollama(ollama::OllamaConfig::default()),
            ProviderConfig::Anthropic(anthropic::AnthropicConfig::default()),
            ProviderConfig::Mistral(openai::OpenAiConfig::mistral()),
        ]
    }
}

/// Uniform adapter contract. `send` blocks the calling worker thread.
pub trait AiProvider: Send + Sync {
    fn internal_name(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn send(&self, request: &ChatRequest, cancel: &CancellationToken)
        -> Result<String, ProviderError>;

    /// Current settings, for persisting.
    fn save_config(&self) -> ProviderConfig;
}

/// Shared HTTP client plus the runtime used to drive it from worker threads.
#[derive(Clone)]
pub struct HttpContext {
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
}

impl HttpContext {
    pub fn new(runtime: tokio::runtime::Handle) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("textrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Misconfigured(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, runtime })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `request` and decodes a JSON body, giving up as soon as `cancel`
    /// fires. Must be called from a thread outside the runtime.
    pub fn post_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, ProviderError> {
        self.runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                result = execute_json::<T>(request) => result,
            }
        })
    }
}

async fn execute_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        return Err(ProviderError::from_status(status.as_u16(), &body));
    }

    response.json::<T>().await.map_err(|e| ProviderError::Api {
        status: status.as_u16(),
        message: format!("Failed to parse API response: {}", e),
    })
}

/// Builds the adapter for a configuration.
pub fn build_provider(config: ProviderConfig, http: HttpContext) -> Arc<dyn AiProvider> {
    match config {
        ProviderConfig::Gemini(c) => Arc::new(gemini::GeminiProvider::new(c, http)),
        ProviderConfig::OpenAiCompatible(c) => {
            Arc::new(openai::OpenAiProvider::new(c, http, openai::Flavor::OpenAi))
        }
        ProviderConfig::Mistral(c) => {
            Arc::new(openai::OpenAiProvider::new(c, http, openai::Flavor::Mistral))
        }
        ProviderConfig::Ollama(c) => Arc::new(ollama::OllamaProvider::new(c, http)),
        ProviderConfig::Anthropic(c) => Arc::new(anthropic::AnthropicProvider::new(c, http)),
    }
}

struct Slot {
    provider: Arc<dyn AiProvider>,
    /// Validation failure recorded at load time; requests fail fast with it.
    problem: Option<ProviderError>,
}

/// The provider list, the current selection and the one live request token.
pub struct ProviderGateway {
    slots: Mutex<Vec<Slot>>,
    current: Mutex<usize>,
    live: Mutex<Option<CancellationToken>>,
    http: Option<HttpContext>,
}

impl ProviderGateway {
    /// Gateway over HTTP adapters built from `configs`.
    pub fn from_configs(http: HttpContext, configs: Vec<ProviderConfig>, current: &str) -> Self {
        let gateway = Self {
            slots: Mutex::new(Vec::new()),
            current: Mutex::new(0),
            live: Mutex::new(None),
            http: Some(http),
        };
        for config in configs {
            if let Err(e) = gateway.load_config(config) {
                warn!("{}", e);
            }
        }
        gateway.set_current(current);
        gateway
    }

    /// Gateway over ready-made adapters. Used by tests and embedders.
    pub fn with_providers(providers: Vec<Arc<dyn AiProvider>>) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| Slot {
                provider,
                problem: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            current: Mutex::new(0),
            live: Mutex::new(None),
            http: None,
        }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.provider.internal_name())
            .collect()
    }

    pub fn current_provider(&self) -> Option<Arc<dyn AiProvider>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let index = *self.current.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(index).map(|s| s.provider.clone())
    }

    /// Selects the provider used by the next dispatch. Unknown names fall back
    /// to the first provider.
    pub fn set_current(&self, name: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match slots.iter().position(|s| s.provider.internal_name() == name) {
            Some(index) => {
                *current = index;
                info!("Current provider: {}", name);
                true
            }
            None => {
                warn!("Unknown provider '{}', falling back to the first one", name);
                *current = 0;
                false
            }
        }
    }

    /// Replaces (or adds) the adapter for this config's provider. The adapter
    /// is installed even when validation fails so the user gets an
    /// actionable error on use; the validation result is returned.
    pub fn load_config(&self, config: ProviderConfig) -> Result<(), ProviderError> {
        let Some(http) = self.http.clone() else {
            return Err(ProviderError::Misconfigured(
                "this gateway cannot build HTTP providers".into(),
            ));
        };

        let problem = config.validate().err();
        let name = config.internal_name();
        let provider = build_provider(config, http);

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = Slot {
            provider,
            problem: problem.clone(),
        };
        match slots.iter().position(|s| s.provider.internal_name() == name) {
            Some(index) => slots[index] = slot,
            None => slots.push(slot),
        }
        debug!("Loaded provider config for {}", name);

        match problem {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn save_config(&self) -> Vec<ProviderConfig> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.provider.save_config())
            .collect()
    }

    /// Cancels whatever request is live and binds a new one to the current
    /// provider.
    pub fn begin(&self) -> Result<BoundRequest, ProviderError> {
        self.cancel();

        let (provider, problem) = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let index = *self.current.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots
                .get(index)
                .ok_or_else(|| ProviderError::Misconfigured("No AI provider is configured.".into()))?;
            (slot.provider.clone(), slot.problem.clone())
        };

        let token = CancellationToken::new();
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Ok(BoundRequest {
            provider,
            problem,
            token,
        })
    }

    /// Cancels the live request, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.live.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if !token.is_cancelled() {
                debug!("Cancelling in-flight provider request");
                token.cancel();
            }
        }
    }
}

/// A request bound to the provider that was current when it was dispatched.
pub struct BoundRequest {
    provider: Arc<dyn AiProvider>,
    problem: Option<ProviderError>,
    token: CancellationToken,
}

impl BoundRequest {
    pub fn provider_name(&self) -> &'static str {
        self.provider.display_name()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs the request on the calling thread.
    pub fn send(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        if self.token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if let Some(problem) = &self.problem {
            return Err(problem.clone());
        }

        let result = self.provider.send(request, &self.token);

        if self.token.is_cancelled() {
            debug!("{} answered after cancellation, dropping", self.provider.internal_name());
            return Err(ProviderError::Cancelled);
        }
        match result {
            Ok(text) if text.trim().is_empty() => Err(ProviderError::EmptyResponse),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl AiProvider for Echo {
        fn internal_name(&self) -> &'static str {
            "echo"
        }
        fn display_name(&self) -> &'static str {
            "Echo"
        }
        fn send(&self, request: &ChatRequest, _: &CancellationToken) -> Result<String, ProviderError> {
            Ok(format!("{:?}", request.turns().len()))
        }
        fn save_config(&self) -> ProviderConfig {
            ProviderConfig::Ollama(ollama::OllamaConfig::default())
        }
    }

    #[test]
    fn status_codes_map_to_kinds() {
        assert!(matches!(ProviderError::from_status(401, "nope"), ProviderError::Auth(_)));
        assert!(matches!(ProviderError::from_status(429, "slow down"), ProviderError::RateLimited(_)));
        assert!(matches!(
            ProviderError::from_status(429, r#"{"error":{"message":"You exceeded your current quota"}}"#),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, r#"{"error":{"message":"API key not valid","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(404, r#"{"error":"model 'llama9' not found"}"#),
            ProviderError::Misconfigured(_)
        ));
    }

    #[test]
    fn error_body_message_is_extracted_and_truncated() {
        assert_eq!(extract_error_message(r#"{"error":{"message":"bad key"}}"#), "bad key");
        assert_eq!(extract_error_message(r#"{"error":"plain"}"#), "plain");
        let long = "x".repeat(1000);
        assert_eq!(extract_error_message(&long).chars().count(), ERROR_BODY_LIMIT + 3);
    }

    #[test]
    fn every_failure_kind_but_cancel_notifies() {
        let kinds = [
            ProviderError::Auth("k".into()),
            ProviderError::RateLimited("r".into()),
            ProviderError::QuotaExceeded("q".into()),
            ProviderError::Network("n".into()),
            ProviderError::ContentBlocked("SAFETY".into()),
            ProviderError::EmptyResponse,
            ProviderError::Misconfigured("m".into()),
            ProviderError::Api { status: 500, message: "boom".into() },
        ];
        for kind in kinds {
            assert!(kind.notification("Gemini").is_some(), "{:?}", kind);
        }
        assert!(ProviderError::Cancelled.notification("Gemini").is_none());
        assert!(ProviderError::Auth("k".into()).notification("Gemini").unwrap().offer_settings);
    }

    #[test]
    fn default_configs_need_keys() {
        for config in ProviderConfig::defaults() {
            let result = config.validate();
            match config {
                ProviderConfig::Ollama(_) => assert!(result.is_ok()),
                _ => assert!(matches!(result, Err(ProviderError::Misconfigured(_)))),
            }
        }
    }

    #[test]
    fn config_round_trips_with_kind_tag() {
        let config = ProviderConfig::Mistral(openai::OpenAiConfig::mistral());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "mistral");
        let back: ProviderConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn begin_cancels_previous_request() {
        let gateway = ProviderGateway::with_providers(vec![Arc::new(Echo)]);
        let first = gateway.begin().unwrap();
        let second = gateway.begin().unwrap();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(first.send(&ChatRequest::single("", "x")), Err(ProviderError::Cancelled));
        assert_eq!(second.send(&ChatRequest::single("", "x")).unwrap(), "1");
    }

    #[test]
    fn unknown_provider_falls_back_to_first() {
        let gateway = ProviderGateway::with_providers(vec![Arc::new(Echo)]);
        assert!(!gateway.set_current("nonexistent"));
        assert_eq!(gateway.current_provider().unwrap().internal_name(), "echo");
    }

    #[test]
    fn empty_gateway_refuses_dispatch() {
        let gateway = ProviderGateway::with_providers(Vec::new());
        assert!(matches!(gateway.begin(), Err(ProviderError::Misconfigured(_))));
    }

    #[test]
    fn keys_are_masked() {
        assert_eq!(masked_key(""), "<unset>");
        assert_eq!(masked_key("short"), "****");
        assert_eq!(masked_key("sk-abcdefghijkl"), "****ijkl");
    }

    #[test]
    fn system_message_leads_chat_messages() {
        let request = ChatRequest::single("be brief", "hello");
        let messages = request.messages_with_system();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], ChatMessage::user("hello"));
    }
}
