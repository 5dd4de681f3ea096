//! Chat transcript behind a response window.
//!
//! A transcript lives exactly as long as its window. Nothing here is
//! persisted: closing the window drops the `Conversation`.

use crate::providers::ChatRequest;
use serde::{Deserialize, Serialize};

/// System instruction used for follow-up questions asked inside a window.
pub const FOLLOWUP_SYSTEM_INSTRUCTION: &str = "You are a helpful AI assistant. Provide clear and direct responses, maintaining the same format and style as your previous responses. If appropriate, use Markdown formatting to make your response more readable.";

/// Shown in the window when a follow-up request fails.
pub const FOLLOWUP_ERROR_REPLY: &str = "Sorry, an error occurred while processing your question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only transcript of one response window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    title: String,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Window opened for an action applied to selected text. The transcript
    /// starts with the original text so follow-ups have context.
    pub fn for_selection(action: &str, selected_text: &str) -> Self {
        Self {
            title: action.to_string(),
            messages: vec![ChatMessage::user(format!(
                "Original text to {}:\n\n{}",
                action.to_lowercase(),
                selected_text
            ))],
        }
    }

    /// Freeform chat with no selected text; the instruction is the first
    /// user message.
    pub fn for_chat(instruction: &str) -> Self {
        Self {
            title: "Chat".to_string(),
            messages: vec![ChatMessage::user(instruction)],
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn append_answer(&mut self, text: &str) {
        self.messages
            .push(ChatMessage::assistant(text.trim_end_matches('\n')));
    }

    /// Records `question` and builds the request carrying the whole
    /// transcript with the follow-up instruction.
    pub fn ask_followup(&mut self, question: &str) -> ChatRequest {
        self.messages.push(ChatMessage::user(question));
        ChatRequest::transcript(FOLLOWUP_SYSTEM_INSTRUCTION, self.messages.clone())
    }

    pub fn append_followup_error(&mut self) {
        self.messages.push(ChatMessage::assistant(FOLLOWUP_ERROR_REPLY));
    }
}
