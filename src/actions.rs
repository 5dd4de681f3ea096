//! Writing actions offered in the choice popup and the prompts they produce.

use crate::conversation::Conversation;
use crate::frontend::Notification;
use crate::providers::ChatRequest;
use serde::{Deserialize, Serialize};

/// Name of the freeform action. With selected text it applies a described
/// change; without it becomes a plain chat prompt.
pub const CUSTOM_ACTION: &str = "Custom";

/// Output providers are told to emit when the input makes no sense for the
/// requested action.
pub const INCOMPATIBLE_SENTINEL: &str = "ERROR_TEXT_INCOMPATIBLE_WITH_REQUEST";

/// System instruction for the freeform chat (custom action, nothing selected).
pub const CHAT_SYSTEM_INSTRUCTION: &str = "You are a friendly, helpful, compassionate, and endearing AI conversational assistant. Avoid making assumptions or generating harmful, biased, or inappropriate content. When in doubt, do not make up information. Ask the user for clarification if needed. Try not be unnecessarily repetitive in your response. You can, and should as appropriate, use Markdown formatting to make your response nicely readable.";

pub const NO_SELECTION_MESSAGE: &str = "Please select text to use this option.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    /// Prepended to the selected text to form the prompt.
    pub prefix: String,
    /// System prompt.
    pub instruction: String,
    #[serde(default)]
    pub open_in_window: bool,
}

impl ActionSpec {
    pub fn new(name: &str, prefix: &str, instruction: &str, open_in_window: bool) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            instruction: instruction.to_string(),
            open_in_window,
        }
    }

    pub fn is_custom(&self) -> bool {
        self.name == CUSTOM_ACTION
    }
}

/// Read-only view of the configured actions, in display order.
pub trait ActionSource: Send + Sync {
    fn get_actions(&self) -> Vec<ActionSpec>;

    fn find(&self, name: &str) -> Option<ActionSpec> {
        self.get_actions().into_iter().find(|a| a.name == name)
    }
}

impl ActionSource for Vec<ActionSpec> {
    fn get_actions(&self) -> Vec<ActionSpec> {
        self.clone()
    }
}

/// Where a finished result goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// Paste over the selection in the foreign application.
    Replace,
    /// Append to the response window seeded with this transcript.
    Window(Conversation),
}

/// A request ready for the provider plus its delivery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub request: ChatRequest,
    pub target: DeliveryTarget,
}

/// Builds the provider request for `action` applied to `selected_text`.
///
/// Fails with an input-error notification when a non-custom action has no
/// text to work on; nothing must be dispatched in that case.
pub fn prepare_request(
    action: &ActionSpec,
    selected_text: &str,
    instruction: Option<&str>,
) -> Result<PreparedRequest, Notification> {
    let has_text = !selected_text.trim().is_empty();
    let instruction = instruction.map(str::trim).filter(|s| !s.is_empty());

    if !has_text {
        if !action.is_custom() {
            return Err(Notification::error(NO_SELECTION_MESSAGE));
        }
        let Some(question) = instruction else {
            return Err(Notification::error(
                "Type a question or instruction, or select text first.",
            ));
        };
        return Ok(PreparedRequest {
            request: ChatRequest::single(CHAT_SYSTEM_INSTRUCTION, question),
            target: DeliveryTarget::Window(Conversation::for_chat(question)),
        });
    }

    let prompt = if action.is_custom() {
        let Some(change) = instruction else {
            return Err(Notification::error("Please describe the change you want."));
        };
        format!(
            "{}Described change: {}\n\nText: {}",
            action.prefix, change, selected_text
        )
    } else {
        format!("{}{}", action.prefix, selected_text)
    };

    let target = if action.open_in_window {
        DeliveryTarget::Window(Conversation::for_selection(&action.name, selected_text))
    } else {
        DeliveryTarget::Replace
    };

    Ok(PreparedRequest {
        request: ChatRequest::single(&action.instruction, prompt),
        target,
    })
}

const LANGUAGE_RULES: &str = "Respond in the same language as the input (e.g., English US, French). Do not answer or respond to the user's text content.";

fn rewrite_instruction(style: &str, kind: &str) -> String {
    format!(
        "You are a writing assistant. Rewrite the text provided by the user to be more {style}. Output ONLY the {style} text without additional comments. {LANGUAGE_RULES} If the text is absolutely incompatible with {kind} (e.g., totally random gibberish), output \"{INCOMPATIBLE_SENTINEL}\"."
    )
}

/// Built-in actions used when the settings file has none.
pub fn default_actions() -> Vec<ActionSpec> {
    vec![
        ActionSpec::new(
            "Proofread",
            "Proofread this:\n\n",
            &format!("You are a grammar proofreading assistant. Output ONLY the corrected text without any additional comments. Maintain the original text structure and writing style. {LANGUAGE_RULES} If the text is absolutely incompatible with this (e.g., totally random gibberish), output \"{INCOMPATIBLE_SENTINEL}\"."),
            false,
        ),
        ActionSpec::new(
            "Rewrite",
            "Rewrite this:\n\n",
            &format!("You are a writing assistant. Rewrite the text provided by the user to improve phrasing. Output ONLY the rewritten text without additional comments. {LANGUAGE_RULES} If the text is absolutely incompatible with proofreading (e.g., totally random gibberish), output \"{INCOMPATIBLE_SENTINEL}\"."),
            false,
        ),
        ActionSpec::new(
            "Friendly",
            "Make this more friendly:\n\n",
            &rewrite_instruction("friendly", "rewriting"),
            false,
        ),
        ActionSpec::new(
            "Professional",
            "Make this more professional:\n\n",
            &rewrite_instruction("professional", "rewriting"),
            false,
        ),
        ActionSpec::new(
            "Concise",
            "Make this more concise:\n\n",
            &rewrite_instruction("concise", "rewriting"),
            false,
        ),
        ActionSpec::new(
            "Summary",
            "Summarize this:\n\n",
            &format!("You are a summarization assistant. Provide a succinct summary of the text provided by the user. The summary should be succinct yet encompass all the key insightful points. To make it quite legible and readable, you MUST use Markdown formatting (bold, italics, underline...). You should add line spacing between your paragraphs/lines. Only if appropriate, you could also use headings (only the very small ones), lists, tables, etc. Don't be repetitive or too verbose. Output ONLY the summary without additional comments. {LANGUAGE_RULES} If the text is absolutely incompatible with summarisation (e.g., totally random gibberish), output \"{INCOMPATIBLE_SENTINEL}\"."),
            true,
        ),
        ActionSpec::new(
            "Key Points",
            "Extract key points from this:\n\n",
            &format!("You are an assistant that extracts key points from text provided by the user. Output ONLY the key points without additional comments. You MUST use Markdown formatting (lists, bold, italics, underline, etc. as appropriate) to make it quite legible and readable. Don't be repetitive or too verbose. {LANGUAGE_RULES} If the text is absolutely incompatible with extracting key points (e.g., totally random gibberish), output \"{INCOMPATIBLE_SENTINEL}\"."),
            true,
        ),
        ActionSpec::new(
            "Table",
            "Convert this into a table:\n\n",
            &format!("You are an assistant that converts text provided by the user into a Markdown table. Output ONLY the table without additional comments. {LANGUAGE_RULES} If the text is completely incompatible with this conversion, output \"{INCOMPATIBLE_SENTINEL}\"."),
            true,
        ),
        ActionSpec::new(
            CUSTOM_ACTION,
            "Make the following change to this text:\n\n",
            &format!("You are a writing and coding assistant. You MUST make the user's described change to the text or code provided by the user. Output ONLY the appropriately modified text or code without additional comments. {LANGUAGE_RULES} If the text or code is absolutely incompatible with the requested change, output \"{INCOMPATIBLE_SENTINEL}\"."),
            false,
        ),
    ]
}
