//! HTTP/SSE surface for the angel proxy
//!
//! A thin axum router over the session engine: JSON everywhere except the
//! stream endpoints, which speak SSE with the engine's one-character event
//! framing. Non-idempotent requests must echo the CSRF token in
//! `X-CSRF-Token`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use angel_core::{
    broker, branch_ops, call_registry, AngelError, BranchId, CreateSessionOptions, Engine,
    EventKind, EventWriter, MessageId, SessionEvent, SessionId, TurnOutcome,
};

/// Shared router state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub csrf: String,
}

/// Build the router
pub fn router(engine: Arc<Engine>) -> anyhow::Result<Router> {
    let csrf = engine
        .main()
        .get_or_init_kv("csrf_key", || uuid::Uuid::new_v4().to_string())?;
    let state = AppState { engine, csrf };
    Ok(Router::new()
        .route("/api/csrf", get(get_csrf))
        .route("/api/chat", get(list_sessions).post(create_chat))
        .route("/api/chat/temp", post(create_temp_chat))
        .route("/api/chat/:id", get(subscribe_chat).post(send_message).delete(delete_chat))
        .route("/api/chat/:id/branch", post(branch_chat).put(switch_branch))
        .route("/api/chat/:id/branch/:bid/confirm", post(confirm_branch))
        .route("/api/chat/:id/branch/:bid/retry-error", post(retry_error))
        .route("/api/chat/:id/cancel", post(cancel_chat))
        .route("/api/chat/:id/compress", post(compress_chat))
        .route("/api/chat/:id/extract", post(extract_chat))
        .route("/api/chat/:id/command", post(run_command))
        .route("/api/chat/:id/roots", put(set_roots))
        .route("/api/search", get(search))
        .route("/:session_id/:blob_ref", get(fetch_blob))
        .layer(CorsLayer::permissive())
        .with_state(state))
}

/// Serve until the process exits
pub async fn serve(engine: Arc<Engine>, port: u16) -> anyhow::Result<()> {
    let app = router(engine)?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(%port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// =============================================================================
// Error mapping
// =============================================================================

struct ApiError(AngelError);

impl From<AngelError> for ApiError {
    fn from(err: AngelError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AngelError::Validation(_) => StatusCode::BAD_REQUEST,
            AngelError::NotFound(_) => StatusCode::NOT_FOUND,
            AngelError::Conflict(_) => StatusCode::CONFLICT,
            AngelError::Permission(_) => StatusCode::FORBIDDEN,
            AngelError::Cancelled => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

fn check_csrf(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let supplied = headers
        .get("X-CSRF-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if supplied != state.csrf {
        return Err(AngelError::validation("missing or invalid CSRF token").into());
    }
    Ok(())
}

fn parse_session(raw: &str) -> Result<SessionId, ApiError> {
    Ok(SessionId::parse(raw)?)
}

// =============================================================================
// SSE plumbing
// =============================================================================

fn to_sse_event(event: &SessionEvent) -> Event {
    // axum splits multi-line data into repeated `data:` lines itself.
    Event::default().data(format!("{}{}", event.kind.type_char(), event.payload))
}

fn is_terminal(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Complete
            | EventKind::PendingConfirmation
            | EventKind::Error
            | EventKind::InitialState
    )
}

type EventStream = futures::stream::BoxStream<'static, Result<Event, Infallible>>;

/// Subscribe, run `op` with a writer, and stream everything it emits until
/// the op finishes and the buffer drains
fn run_streaming<F, Fut>(engine: Arc<Engine>, session: SessionId, op: F) -> Sse<EventStream>
where
    F: FnOnce(Arc<Engine>, SessionId, EventWriter) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let rx = broker().subscribe(&session);
    let writer = broker().writer(&session);
    let task = tokio::spawn(op(engine, session, writer));

    let stream = futures::stream::unfold(
        (rx, Some(task)),
        |(mut rx, mut task)| async move {
            loop {
                if let Some(handle) = task.as_mut() {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(event) => {
                                return Some((Ok(to_sse_event(&event)), (rx, task)));
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => return None,
                        },
                        _ = handle => {
                            task = None;
                            continue;
                        }
                    }
                }
                // The op finished; drain whatever is buffered, then close.
                match rx.try_recv() {
                    Ok(event) => return Some((Ok(to_sse_event(&event)), (rx, task))),
                    Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        },
    );
    Sse::new(Box::pin(stream) as EventStream)
}

fn report_turn(result: angel_core::AngelResult<TurnOutcome>, writer: &EventWriter) {
    match result {
        Ok(outcome) => tracing::debug!(?outcome, "turn finished"),
        Err(err) => {
            writer.send(EventKind::Error, err.to_string());
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn get_csrf(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "token": state.csrf }))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state
        .engine
        .main()
        .list_sessions(query.workspace_id.as_deref())?;
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Deserialize)]
struct CreateChatBody {
    message: String,
    #[serde(rename = "systemPrompt")]
    system_prompt: Option<String>,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateChatBody>,
) -> Result<Sse<EventStream>, ApiError> {
    create_chat_inner(state, headers, body, false)
}

async fn create_temp_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateChatBody>,
) -> Result<Sse<EventStream>, ApiError> {
    create_chat_inner(state, headers, body, true)
}

fn create_chat_inner(
    state: AppState,
    headers: HeaderMap,
    body: CreateChatBody,
    temporary: bool,
) -> Result<Sse<EventStream>, ApiError> {
    check_csrf(&state, &headers)?;
    let created = state.engine.create_session(CreateSessionOptions {
        temporary,
        system_prompt: body.system_prompt,
        workspace_id: body.workspace_id,
        ..Default::default()
    })?;
    let branch = created.branch;
    let message = body.message;
    Ok(run_streaming(
        Arc::clone(&state.engine),
        created.id,
        move |engine, session, writer| async move {
            writer.send(EventKind::WorkspaceHint, session.as_str());
            let result = engine
                .user_turn(&session, Some(branch), &message, Vec::new(), &writer)
                .await;
            report_turn(result, &writer);
        },
    ))
}

#[derive(Deserialize)]
struct SendBody {
    message: String,
    #[serde(rename = "branchId")]
    branch_id: Option<i64>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> Result<Sse<EventStream>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let branch = body.branch_id.map(BranchId);
    let message = body.message;
    Ok(run_streaming(
        Arc::clone(&state.engine),
        session,
        move |engine, session, writer| async move {
            let result = engine
                .user_turn(&session, branch, &message, Vec::new(), &writer)
                .await;
            report_turn(result, &writer);
        },
    ))
}

/// Load history and subscribe. With a call in flight the snapshot arrives
/// as `0` (with the elapsed time) followed by live events; otherwise a `1`
/// snapshot is sent and the connection closes.
async fn subscribe_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<EventStream>, ApiError> {
    let session = parse_session(&id)?;
    let mut snapshot = state.engine.snapshot(&session)?;
    let elapsed = call_registry::active_elapsed(&session);

    if let Some(elapsed) = elapsed {
        snapshot["elapsed_ms"] = json!(elapsed.as_millis() as u64);
        let first = SessionEvent::new(EventKind::InitialStateWithCall, snapshot.to_string());
        let rx = broker().subscribe(&session);
        let live = futures::stream::unfold((rx, false), |(mut rx, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // A terminal event is yielded, then the stream ends.
                        let done = is_terminal(event.kind);
                        return Some((Ok(to_sse_event(&event)), (rx, done)));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        });
        let stream = futures::stream::iter([Ok(to_sse_event(&first))]).chain(live);
        Ok(Sse::new(Box::pin(stream) as EventStream))
    } else {
        let first = SessionEvent::new(EventKind::InitialState, snapshot.to_string());
        let stream = futures::stream::iter([Ok(to_sse_event(&first))]);
        Ok(Sse::new(Box::pin(stream) as EventStream))
    }
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    state.engine.delete_session(&session)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct BranchBody {
    #[serde(rename = "messageId")]
    message_id: i64,
    text: Option<String>,
}

#[derive(Deserialize)]
struct BranchQuery {
    retry: Option<String>,
}

async fn branch_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BranchQuery>,
    headers: HeaderMap,
    Json(body): Json<BranchBody>,
) -> Result<Sse<EventStream>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let message = MessageId(body.message_id);
    let retry = query.retry.as_deref() == Some("1");
    let text = body.text;
    Ok(run_streaming(
        Arc::clone(&state.engine),
        session,
        move |engine, session, writer| async move {
            let new_text = if retry { None } else { text.as_deref() };
            let result =
                branch_ops::fork_and_rerun(&engine, &session, message, new_text, &writer).await;
            report_turn(result.map(|(_, outcome)| outcome), &writer);
        },
    ))
}

#[derive(Deserialize)]
struct SwitchBody {
    #[serde(rename = "branchId")]
    branch_id: i64,
}

async fn switch_branch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SwitchBody>,
) -> Result<StatusCode, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    state.engine.switch_primary(&session, BranchId(body.branch_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ConfirmBody {
    approved: bool,
    #[serde(rename = "modifiedData")]
    modified_data: Option<serde_json::Map<String, serde_json::Value>>,
}

async fn confirm_branch(
    State(state): State<AppState>,
    Path((id, bid)): Path<(String, i64)>,
    headers: HeaderMap,
    Json(body): Json<ConfirmBody>,
) -> Result<Sse<EventStream>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let branch = BranchId(bid);
    Ok(run_streaming(
        Arc::clone(&state.engine),
        session,
        move |engine, session, writer| async move {
            let result = engine
                .confirm(&session, branch, body.approved, body.modified_data, &writer)
                .await;
            report_turn(result, &writer);
        },
    ))
}

async fn retry_error(
    State(state): State<AppState>,
    Path((id, bid)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Result<Sse<EventStream>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let branch = BranchId(bid);
    Ok(run_streaming(
        Arc::clone(&state.engine),
        session,
        move |engine, session, writer| async move {
            let result = engine.retry_error(&session, branch, &writer).await;
            report_turn(result, &writer);
        },
    ))
}

/// Cancel the session's in-flight call (and its sub-agents); idempotent
async fn cancel_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    call_registry::cancel(&session);
    Ok(StatusCode::NO_CONTENT)
}

async fn compress_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let outcome = state.engine.compress(&session).await?;
    Ok(Json(json!({
        "preTokens": outcome.pre_tokens,
        "postTokens": outcome.post_tokens,
        "compressedMessages": outcome.compressed_messages,
    })))
}

#[derive(Deserialize)]
struct ExtractBody {
    #[serde(rename = "messageId")]
    message_id: i64,
}

async fn extract_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExtractBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let new_id = state.engine.extract(&session, MessageId(body.message_id))?;
    Ok(Json(json!({ "sessionId": new_id.as_str() })))
}

#[derive(Deserialize)]
struct CommandBody {
    command: String,
    text: Option<String>,
}

async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<StatusCode, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    state
        .engine
        .run_command(&session, &body.command, body.text.as_deref())?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RootsBody {
    roots: Vec<String>,
}

async fn set_roots(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RootsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_csrf(&state, &headers)?;
    let session = parse_session(&id)?;
    let roots = body.roots.into_iter().map(std::path::PathBuf::from).collect();
    let generation = state.engine.set_roots(&session, roots)?;
    Ok(Json(json!({ "generation": generation })))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    substring: bool,
    limit: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hits = state
        .engine
        .search(&query.q, query.substring, query.limit.unwrap_or(50))?;
    Ok(Json(json!({ "hits": hits })))
}

async fn fetch_blob(
    State(state): State<AppState>,
    Path((session_id, blob_ref)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let Some(hash) = blob_ref.strip_prefix('@') else {
        return Err(AngelError::not_found("not a blob reference").into());
    };
    let session = parse_session(&session_id)?;
    let bytes = state.engine.blob_bytes(&session, hash)?;
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}
