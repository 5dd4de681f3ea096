//! Google Gemini through the `generateContent` REST endpoint.

use super::{AiProvider, ChatRequest, HttpContext, ProviderConfig, ProviderError};
use crate::conversation::Role;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_OUTPUT_TOKENS: u32 = 1000;
const TEMPERATURE: f32 = 0.5;

/// Harm categories relaxed to BLOCK_NONE; blocked output is still reported
/// through `promptFeedback` / `finishReason`.
const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    candidate_count: u32,
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn build_body(request: &ChatRequest) -> GenerateRequest {
    let system_instruction = (!request.system_instruction.trim().is_empty()).then(|| {
        SystemInstruction {
            parts: vec![Part {
                text: request.system_instruction.clone(),
            }],
        }
    });

    let contents = request
        .turns()
        .into_iter()
        .map(|m| Content {
            role: if m.role == Role::Assistant { "model" } else { "user" },
            parts: vec![Part { text: m.content }],
        })
        .collect();

    GenerateRequest {
        system_instruction,
        contents,
        generation_config: GenerationConfig {
            candidate_count: 1,
            max_output_tokens: MAX_OUTPUT_TOKENS,
            temperature: TEMPERATURE,
        },
        safety_settings: HARM_CATEGORIES
            .iter()
            .map(|&category| SafetySetting {
                category,
                threshold: "BLOCK_NONE",
            })
            .collect(),
    }
}

fn extract_text(response: GenerateResponse) -> Result<String, ProviderError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ProviderError::ContentBlocked(reason));
    }
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(ProviderError::EmptyResponse);
    };
    if let Some(reason @ ("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST")) =
        candidate.finish_reason.as_deref()
    {
        return Err(ProviderError::ContentBlocked(reason.to_string()));
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim_end_matches('\n').to_string();
    if text.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(text)
}

pub struct GeminiProvider {
    config: GeminiConfig,
    http: HttpContext,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig, http: HttpContext) -> Self {
        Self { config, http }
    }
}

impl AiProvider for GeminiProvider {
    fn internal_name(&self) -> &'static str {
        "gemini"
    }

    fn display_name(&self) -> &'static str {
        "Gemini"
    }

    fn send(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", API_BASE, self.config.model);
        debug!(
            "Sending Gemini request to {} (key {})",
            url,
            super::masked_key(&self.config.api_key)
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|e| {
                ProviderError::Misconfigured(format!("Invalid API key header value: {}", e))
            })?,
        );

        let builder = self
            .http
            .client()
            .post(&url)
            .headers(headers)
            .json(&build_body(request));
        let response: GenerateResponse = self.http.post_json(builder, cancel)?;
        extract_text(response)
    }

    fn save_config(&self) -> ProviderConfig {
        ProviderConfig::Gemini(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;

    #[test]
    fn assistant_turns_become_model_role() {
        let request = ChatRequest::transcript(
            "sys",
            vec![ChatMessage::user("q"), ChatMessage::assistant("a")],
        );
        let json = serde_json::to_value(build_body(&request)).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(json["safetySettings"].as_array().unwrap().len(), 4);
        assert_eq!(json["generationConfig"]["maxOutputTokens"], MAX_OUTPUT_TOKENS);
    }

    #[test]
    fn trailing_newlines_are_dropped() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Line one\n"},{"text":"Line two\n\n"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "Line one\nLine two");
    }

    #[test]
    fn blocked_prompt_is_content_blocked() {
        let response: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(
            extract_text(response),
            Err(ProviderError::ContentBlocked("SAFETY".into()))
        );

        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"finishReason":"SAFETY"}]}"#,
        )
        .unwrap();
        assert!(matches!(extract_text(response), Err(ProviderError::ContentBlocked(_))));
    }

    #[test]
    fn no_candidates_is_empty_response() {
        let response: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(extract_text(response), Err(ProviderError::EmptyResponse));
    }
}
