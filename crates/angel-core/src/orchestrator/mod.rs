//! Streaming orchestrator
//!
//! One invocation per user turn: register the call, assemble the request,
//! stream the model's parts into durable messages and broadcast events,
//! dispatch function calls through the tool registry, and loop while the
//! model keeps reacting to tool output. The loop pauses (without closing
//! the session) when a tool asks for user confirmation and stops on
//! cancellation, provider failure, or a plain model turn.

pub mod assemble;
pub mod branch_ops;
pub mod compress;
pub mod registry;
pub mod state;

use std::sync::Arc;

use serde_json::json;
use tokio_stream::StreamExt;

use crate::error::{AngelError, AngelResult};
use crate::events::{EventKind, EventWriter};
use crate::history::CurationOptions;
use crate::llm::provider::{estimate_tokens, GenerateParams, Part};
use crate::session::Engine;
use crate::storage::message::{Attachment, MessageKind, NewMessage};
use crate::storage::MessageChain;
use crate::tools::{ToolCall, ToolContext, ToolOutcome};
use crate::types::{BranchId, SessionId};

pub use compress::{compress_session, CompressionOutcome, COMPRESSION_TRIGGER_RATIO};
pub use state::BranchState;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Plain model turn with no pending call; `Q` was emitted
    Completed,
    /// A tool is waiting for user approval; the stream closed without `Q`
    AwaitingConfirmation,
    /// The call was cancelled; a cancellation-shaped error was persisted
    Cancelled,
    /// The provider failed mid-stream; a model-error row was persisted
    Failed,
}

/// Run one orchestrator invocation for `session_id` on `branch`
pub async fn run_turn(
    engine: &Arc<Engine>,
    session_id: &SessionId,
    branch: BranchId,
    writer: &EventWriter,
) -> AngelResult<TurnOutcome> {
    let guard = registry::register(session_id)?;
    let cancel = guard.cancel_token();
    let handle = engine.acquire(session_id)?;
    let local = session_id.local_id();
    let model = engine.config().default_model.clone();

    loop {
        // Assemble: curated history + system prompt + tool declarations.
        let session_row = handle.require_session(&local)?;
        let history = assemble::turn_history(&handle, branch)?;
        let contents =
            assemble::contents_for_request(&handle, &history, CurationOptions::default())?;
        let params = GenerateParams {
            contents,
            system_prompt: session_row.system_prompt.clone(),
            tools: engine.registry().declarations(),
            include_thoughts: true,
            temperature: None,
            top_p: None,
        };

        // Compression guard: 70 % of the model's window.
        let window = engine.provider().max_tokens(&model).await;
        let estimate = estimate_tokens(&params.contents);
        if estimate as f64 > window as f64 * COMPRESSION_TRIGGER_RATIO {
            match compress_session(
                &handle,
                engine.provider().as_ref(),
                &model,
                &local,
                branch,
                Engine::now(),
            )
            .await
            {
                Ok(outcome) => {
                    tracing::info!(
                        pre = outcome.pre_tokens,
                        post = outcome.post_tokens,
                        "compression guard fired"
                    );
                    continue; // restart assembly over the replaced history
                }
                Err(err) => tracing::warn!(%err, "compression guard skipped"),
            }
        }

        let opened = tokio::select! {
            opened = engine.provider().send_message_stream(&model, &params) => opened,
            _ = cancel.cancelled() => {
                return finish_cancelled(&handle, &local, branch, &model, writer);
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                // Failing to open counts as a provider failure like a
                // mid-stream break: the session stays intact for
                // retry-error.
                let mut chain = MessageChain::load(&handle, &local, branch)?;
                chain.add(
                    NewMessage::new(MessageKind::ModelError, err.to_string()).with_model(&model),
                    Engine::now(),
                )?;
                writer.send(EventKind::Error, err.to_string());
                return Ok(TurnOutcome::Failed);
            }
        };

        let mut chain = MessageChain::load(&handle, &local, branch)?;
        let mut text_buf = String::new();
        let mut inline_attachments: Vec<Attachment> = Vec::new();
        let mut saw_tool_response = false;

        'stream: loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => {
                    return finish_cancelled(&handle, &local, branch, &model, writer);
                }
            };
            let Some(item) = next else { break 'stream };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    // Provider failure: persist and surface, leave the
                    // session intact so the user can retry-error.
                    chain.add(
                        NewMessage::new(MessageKind::ModelError, err.to_string())
                            .with_model(&model),
                        Engine::now(),
                    )?;
                    writer.send(EventKind::Error, err.to_string());
                    return Ok(TurnOutcome::Failed);
                }
            };

            for part in chunk.parts {
                match part {
                    Part::Text(text) => {
                        writer.send(EventKind::ModelDelta, &text);
                        text_buf.push_str(&text);
                    }
                    Part::Thought(text) => {
                        let record = chain.add(
                            NewMessage::new(MessageKind::Thought, &text)
                                .with_model(&model)
                                .with_token_delta(token_delta(&text)),
                            Engine::now(),
                        )?;
                        writer.send(
                            EventKind::Thought,
                            json!({ "id": record.id, "text": text }).to_string(),
                        );
                    }
                    Part::InlineData { mime_type, data } => {
                        let hash = handle.save_blob(&data)?;
                        let attachment = Attachment {
                            hash: hash.clone(),
                            file_name: format!("inline-{}", inline_attachments.len()),
                            mime_type: mime_type.clone(),
                            omitted: false,
                        };
                        writer.send(
                            EventKind::ModelDelta,
                            format!("[inline {mime_type} {hash}]"),
                        );
                        inline_attachments.push(attachment);
                    }
                    Part::ExecutableCode { language, code } => {
                        let rendered = format!("\n```{language}\n{code}\n```\n");
                        writer.send(EventKind::ModelDelta, &rendered);
                        text_buf.push_str(&rendered);
                    }
                    Part::CodeExecutionResult { outcome, output } => {
                        let rendered = format!("\n[{outcome}]\n{output}\n");
                        writer.send(EventKind::ModelDelta, &rendered);
                        text_buf.push_str(&rendered);
                    }
                    Part::FunctionCall { name, args } => {
                        flush_model_text(
                            &mut chain,
                            &mut text_buf,
                            &mut inline_attachments,
                            &model,
                        )?;
                        let call = ToolCall::new(name, args);
                        let call_record = chain.add(
                            NewMessage::new(MessageKind::FunctionCall, call.to_message_text())
                                .with_model(&model)
                                .with_token_delta(token_delta(&call.to_message_text())),
                            Engine::now(),
                        )?;
                        writer.send(
                            EventKind::FunctionCall,
                            json!({
                                "id": call_record.id,
                                "name": call.name,
                                "args": call.args,
                            })
                            .to_string(),
                        );

                        let ctx = ToolContext {
                            session_id: session_id.clone(),
                            fs: engine.fs_for(session_id)?,
                            db: Arc::clone(handle.db()),
                            confirmation_received: false,
                            cancel: cancel.clone(),
                            subagent: Some(engine.subagent_spawner()),
                        };
                        match dispatch_call(engine, &ctx, &call).await {
                            DispatchResult::Response(body, attachments) => {
                                let record = chain.add(
                                    NewMessage::new(MessageKind::FunctionResponse, body.to_string())
                                        .with_attachments(attachments)
                                        .with_token_delta(token_delta(&body.to_string())),
                                    Engine::now(),
                                )?;
                                writer.send(
                                    EventKind::FunctionReply,
                                    json!({ "id": record.id, "body": body }).to_string(),
                                );
                                saw_tool_response = true;
                            }
                            DispatchResult::Pending(context) => {
                                let payload = json!({ "call": call, "context": context });
                                handle.set_pending_confirmation(branch, Some(&payload))?;
                                writer.send(
                                    EventKind::PendingConfirmation,
                                    payload.to_string(),
                                );
                                // Stop the outer loop without closing the
                                // session; no Q is emitted.
                                return Ok(TurnOutcome::AwaitingConfirmation);
                            }
                        }
                    }
                    Part::FunctionResponse { .. } => {
                        // Providers never stream these back; ignore.
                    }
                }
            }
        }

        flush_model_text(&mut chain, &mut text_buf, &mut inline_attachments, &model)?;

        // Loop condition: the model gets to react to tool output.
        let tail_is_response = handle
            .last_message(branch)?
            .map(|m| m.kind == MessageKind::FunctionResponse)
            .unwrap_or(false);
        if saw_tool_response && tail_is_response {
            continue;
        }
        writer.send(EventKind::Complete, "");
        return Ok(TurnOutcome::Completed);
    }
}

enum DispatchResult {
    Response(serde_json::Value, Vec<Attachment>),
    Pending(serde_json::Value),
}

/// Dispatch one call. Handler and schema failures both come back as
/// error-shaped response bodies so the model can see and recover.
async fn dispatch_call(engine: &Arc<Engine>, ctx: &ToolContext, call: &ToolCall) -> DispatchResult {
    match engine.registry().dispatch(ctx, call).await {
        Ok(Ok(ToolOutcome::Success { value, attachments })) => DispatchResult::Response(
            json!({ "name": call.name, "response": value }),
            attachments,
        ),
        Ok(Ok(ToolOutcome::PendingConfirmation { context })) => DispatchResult::Pending(context),
        Ok(Err(failure)) => DispatchResult::Response(
            json!({ "name": call.name, "error": failure.message }),
            Vec::new(),
        ),
        Err(err) => DispatchResult::Response(
            json!({ "name": call.name, "error": err.to_string() }),
            Vec::new(),
        ),
    }
}

/// Re-invoke a confirmed call and resume the loop. `approved` with
/// optional modified arguments re-runs the handler; denial appends a
/// synthetic declined response and lets the model react to it.
pub async fn resume_after_confirmation(
    engine: &Arc<Engine>,
    session_id: &SessionId,
    branch: BranchId,
    approved: bool,
    modified_args: Option<serde_json::Map<String, serde_json::Value>>,
    writer: &EventWriter,
) -> AngelResult<TurnOutcome> {
    let handle = engine.acquire(session_id)?;
    let local = session_id.local_id();
    let branch_row = handle.require_branch(branch)?;
    let payload = state::ensure_awaiting_confirmation(&branch_row)?;
    let call: ToolCall = serde_json::from_value(payload["call"].clone())
        .map_err(|e| AngelError::storage(format!("corrupt pending payload: {e}")))?;
    handle.set_pending_confirmation(branch, None)?;

    let mut chain = MessageChain::load(&handle, &local, branch)?;
    if approved {
        let call = ToolCall {
            name: call.name,
            args: modified_args.unwrap_or(call.args),
        };
        let ctx = ToolContext {
            session_id: session_id.clone(),
            fs: engine.fs_for(session_id)?,
            db: Arc::clone(handle.db()),
            confirmation_received: true,
            cancel: tokio_util::sync::CancellationToken::new(),
            subagent: Some(engine.subagent_spawner()),
        };
        match dispatch_call(engine, &ctx, &call).await {
            DispatchResult::Response(body, attachments) => {
                let record = chain.add(
                    NewMessage::new(MessageKind::FunctionResponse, body.to_string())
                        .with_attachments(attachments)
                        .with_token_delta(token_delta(&body.to_string())),
                    Engine::now(),
                )?;
                writer.send(
                    EventKind::FunctionReply,
                    json!({ "id": record.id, "body": body }).to_string(),
                );
            }
            DispatchResult::Pending(_) => {
                // A handler asking again right after approval would wedge
                // the branch; treat it as a handler failure.
                let body = json!({ "name": call.name, "error": "tool requested confirmation again" });
                let record = chain.add(
                    NewMessage::new(MessageKind::FunctionResponse, body.to_string()),
                    Engine::now(),
                )?;
                writer.send(
                    EventKind::FunctionReply,
                    json!({ "id": record.id, "body": body }).to_string(),
                );
            }
        }
    } else {
        let body = json!({ "name": call.name, "error": "user declined the request" });
        let record = chain.add(
            NewMessage::new(MessageKind::FunctionResponse, body.to_string()),
            Engine::now(),
        )?;
        writer.send(
            EventKind::FunctionReply,
            json!({ "id": record.id, "body": body }).to_string(),
        );
    }
    drop(handle);

    run_turn(engine, session_id, branch, writer).await
}

fn finish_cancelled(
    db: &crate::storage::SessionDb,
    local: &str,
    branch: BranchId,
    model: &str,
    writer: &EventWriter,
) -> AngelResult<TurnOutcome> {
    let mut chain = MessageChain::load(db, local, branch)?;
    chain.add(
        NewMessage::new(MessageKind::Error, "call cancelled").with_model(model),
        Engine::now(),
    )?;
    writer.send(EventKind::Error, "call cancelled");
    Ok(TurnOutcome::Cancelled)
}

fn flush_model_text(
    chain: &mut MessageChain<'_>,
    text_buf: &mut String,
    attachments: &mut Vec<Attachment>,
    model: &str,
) -> AngelResult<()> {
    if text_buf.is_empty() && attachments.is_empty() {
        return Ok(());
    }
    let text = std::mem::take(text_buf);
    let attached = std::mem::take(attachments);
    chain.add(
        NewMessage::new(MessageKind::ModelText, &text)
            .with_attachments(attached)
            .with_model(model)
            .with_token_delta(token_delta(&text)),
        Engine::now(),
    )?;
    Ok(())
}

/// chars/4 proxy, matching the compression heuristic
fn token_delta(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}
