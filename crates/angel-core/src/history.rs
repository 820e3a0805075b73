//! History curation
//!
//! Turns the stored message sequence of a branch into a clean request
//! history for the LLM. The filter is deterministic and idempotent: running
//! it over its own output returns the same sequence.

use serde_json::json;

use crate::storage::message::{Attachment, MessageKind, MessageRecord};

/// Name of the synthetic tool used to surface prompt/environment shifts to
/// the model as explicit turns
pub const NEW_SYSTEM_PROMPT_FN: &str = "new_system_prompt";

/// Reminder rendered in place of attachment bytes hidden by `/clearblobs`
pub fn omitted_attachment_note(attachment: &Attachment) -> String {
    format!(
        "[attachment {} ({}) omitted; use the recall tool with hash {} to fetch it]",
        attachment.file_name, attachment.mime_type, attachment.hash
    )
}

/// Knobs for the curation filter
#[derive(Debug, Clone, Copy, Default)]
pub struct CurationOptions {
    /// Keep thought messages in the output
    pub include_thoughts: bool,
    /// Keep model-error and generic-error messages in the output
    pub include_errors: bool,
}

/// Apply the curation rules, in order:
/// 1. collapse runs of consecutive user text, keeping only the last;
/// 2. drop function calls not followed (modulo intervening thoughts) by a
///    function response;
/// 3. drop thoughts, errors, and command messages unless requested;
/// 4. re-materialize system-prompt and environment-change messages as a
///    model-side `new_system_prompt` call plus a user-side response.
///
/// Attachment omission (`/clearblobs`) is carried by the persisted
/// `omitted` flag; rendering of omitted attachments happens at request
/// conversion via [`omitted_attachment_note`].
pub fn curate(messages: &[MessageRecord], opts: CurationOptions) -> Vec<MessageRecord> {
    let mut out: Vec<MessageRecord> = Vec::with_capacity(messages.len());

    // Rule 1: only the last of a consecutive user-text run survives.
    for msg in messages {
        if msg.kind == MessageKind::UserText {
            if let Some(prev) = out.last() {
                if prev.kind == MessageKind::UserText {
                    out.pop();
                }
            }
        }
        out.push(msg.clone());
    }

    // Rule 2: a function call must be answered, thoughts may intervene.
    let answered: Vec<bool> = out
        .iter()
        .enumerate()
        .map(|(idx, msg)| {
            if msg.kind != MessageKind::FunctionCall {
                return true;
            }
            out[idx + 1..]
                .iter()
                .find(|m| m.kind != MessageKind::Thought)
                .map(|m| m.kind == MessageKind::FunctionResponse)
                .unwrap_or(false)
        })
        .collect();
    let mut keep = answered.into_iter();
    out.retain(|_| keep.next().unwrap_or(true));

    // Rule 3: thoughts, errors, and commands are UI artifacts by default.
    out.retain(|msg| match msg.kind {
        MessageKind::Thought => opts.include_thoughts,
        MessageKind::ModelError | MessageKind::Error => opts.include_errors,
        MessageKind::Command => false,
        _ => true,
    });

    // Rule 4: the model observes prompt and environment shifts as explicit
    // call/response turns.
    let mut rendered = Vec::with_capacity(out.len() + 4);
    for msg in out {
        match msg.kind {
            MessageKind::SystemPrompt | MessageKind::EnvChange => {
                let response_body = if msg.kind == MessageKind::SystemPrompt {
                    json!({ "prompt": msg.text })
                } else {
                    serde_json::from_str(&msg.text)
                        .unwrap_or_else(|_| json!({ "environment": msg.text }))
                };
                let mut call = msg.clone();
                call.kind = MessageKind::FunctionCall;
                call.text = json!({ "name": NEW_SYSTEM_PROMPT_FN, "args": {} }).to_string();
                call.attachments = Vec::new();
                let mut response = msg.clone();
                response.kind = MessageKind::FunctionResponse;
                response.text =
                    json!({ "name": NEW_SYSTEM_PROMPT_FN, "response": response_body }).to_string();
                response.attachments = Vec::new();
                rendered.push(call);
                rendered.push(response);
            }
            _ => rendered.push(msg),
        }
    }

    rendered
}
