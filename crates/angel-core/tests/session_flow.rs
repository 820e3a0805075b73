//! End-to-end engine scenarios driven with the scripted provider

use std::sync::Arc;

use serde_json::{json, Value};

use angel_core::{
    broker, Chunk, Config, CreateSessionOptions, Engine, EventKind, MessageKind, Part,
    ScriptedProvider, SessionEvent, SessionId, Tool, ToolContext, ToolFailure, ToolOutcome,
    ToolParameter, ToolRegistry, ToolSchema, TurnOutcome,
};

struct ReadFileTool;

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "read_file",
            "Read a file from the session filesystem",
            vec![ToolParameter::string("file_path", "Path to read")],
        )
    }

    async fn run(
        &self,
        _ctx: &ToolContext,
        _args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        Ok(ToolOutcome::success(json!({ "content": "# Title" })))
    }
}

/// Asks for confirmation unless it was just granted
struct GuardedWriteTool;

#[async_trait::async_trait]
impl Tool for GuardedWriteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "write_file",
            "Write a file, asking the user first",
            vec![
                ToolParameter::string("file_path", "Target path"),
                ToolParameter::string("content", "Content to write"),
            ],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        if !ctx.confirmation_received {
            return Ok(ToolOutcome::pending(json!({
                "file_path": args["file_path"],
                "content": args["content"],
            })));
        }
        Ok(ToolOutcome::success(json!({
            "written": args["file_path"],
        })))
    }
}

fn build_engine(provider: Arc<ScriptedProvider>) -> (tempfile::TempDir, Arc<Engine>) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(GuardedWriteTool));
    let engine = Engine::new(config, provider, Arc::new(registry)).unwrap();
    (dir, engine)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[SessionEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn call_part(name: &str, args: Value) -> Part {
    Part::FunctionCall {
        name: name.to_string(),
        args: args.as_object().cloned().unwrap_or_default(),
    }
}

#[tokio::test]
async fn basic_turn_persists_linked_rows_and_streams_events() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![Part::Text("hello".into())]);
    provider.push_one_shot("Friendly greeting"); // title generation
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine
        .create_session(CreateSessionOptions {
            system_prompt: Some("you are helpful".into()),
            ..Default::default()
        })
        .unwrap();
    let mut rx = broker().subscribe(&created.id);
    let writer = broker().writer(&created.id);

    let outcome = engine
        .user_turn(&created.id, Some(created.branch), "hi", Vec::new(), &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Acknowledge,
            EventKind::ModelDelta,
            EventKind::Complete,
            EventKind::SessionName,
        ]
    );
    assert_eq!(events[1].payload, "hello");

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, MessageKind::UserText);
    assert_eq!(history[1].kind, MessageKind::ModelText);
    assert_eq!(history[1].parent_id, Some(history[0].id));
    assert_eq!(history[0].chosen_next_id, Some(history[1].id));

    // The system prompt travelled with the request.
    let request = &provider.requests()[0];
    assert_eq!(request.system_prompt.as_deref(), Some("you are helpful"));
    assert!(!request.tools.is_empty());

    // Title generation renamed the session.
    assert_eq!(
        engine.main().get_session(&created.id).unwrap().unwrap().name.as_deref(),
        Some("Friendly greeting")
    );
}

#[tokio::test]
async fn tool_loop_persists_call_response_model_order() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![call_part("read_file", json!({"file_path": "README.md"}))]);
    provider.push_parts(vec![Part::Text("The title is Title".into())]);
    provider.push_one_shot("Readme title");
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let mut rx = broker().subscribe(&created.id);
    let writer = broker().writer(&created.id);

    let outcome = engine
        .user_turn(&created.id, Some(created.branch), "read README", Vec::new(), &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Acknowledge,
            EventKind::FunctionCall,
            EventKind::FunctionReply,
            EventKind::ModelDelta,
            EventKind::Complete,
            EventKind::SessionName,
        ]
    );

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    let row_kinds: Vec<_> = history.iter().map(|m| m.kind).collect();
    assert_eq!(
        row_kinds,
        vec![
            MessageKind::UserText,
            MessageKind::FunctionCall,
            MessageKind::FunctionResponse,
            MessageKind::ModelText,
        ]
    );
    let response: Value = serde_json::from_str(&history[2].text).unwrap();
    assert_eq!(response["response"]["content"], "# Title");

    // The second provider request carried the tool output back.
    assert_eq!(provider.requests().len(), 2);
}

#[tokio::test]
async fn pending_confirmation_pauses_then_resumes_on_approval() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![call_part(
        "write_file",
        json!({"file_path": "/etc/hosts", "content": "x"}),
    )]);
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let mut rx = broker().subscribe(&created.id);
    let writer = broker().writer(&created.id);

    let outcome = engine
        .user_turn(&created.id, Some(created.branch), "write it", Vec::new(), &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::AwaitingConfirmation);

    // Stream closed without Q; the pending payload is on the branch.
    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Acknowledge,
            EventKind::FunctionCall,
            EventKind::PendingConfirmation,
        ]
    );
    let handle = engine.acquire(&created.id).unwrap();
    let branch_row = handle.require_branch(created.branch).unwrap();
    let pending = branch_row.pending_confirmation.unwrap();
    assert_eq!(pending["call"]["name"], "write_file");
    drop(handle);

    // A second user turn on the pending branch is rejected.
    let err = engine
        .user_turn(&created.id, Some(created.branch), "hurry up", Vec::new(), &writer)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // Approve with modified arguments; the model then continues.
    provider.push_parts(vec![Part::Text("done".into())]);
    provider.push_one_shot("Write request");
    let modified = json!({"file_path": "/tmp/x", "content": "x"})
        .as_object()
        .cloned();
    let outcome = engine
        .confirm(&created.id, created.branch, true, modified, &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::FunctionReply,
            EventKind::ModelDelta,
            EventKind::Complete,
            EventKind::SessionName,
        ]
    );

    let handle = engine.acquire(&created.id).unwrap();
    assert!(handle
        .require_branch(created.branch)
        .unwrap()
        .pending_confirmation
        .is_none());
    let history = handle.branch_history(created.branch).unwrap();
    let response: Value = serde_json::from_str(&history[2].text).unwrap();
    assert_eq!(response["response"]["written"], "/tmp/x");
}

#[tokio::test]
async fn denied_confirmation_feeds_decline_to_model() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![call_part(
        "write_file",
        json!({"file_path": "/etc/hosts", "content": "x"}),
    )]);
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);
    engine
        .user_turn(&created.id, Some(created.branch), "write it", Vec::new(), &writer)
        .await
        .unwrap();

    provider.push_parts(vec![Part::Text("understood, skipping".into())]);
    provider.push_one_shot("Declined write");
    let outcome = engine
        .confirm(&created.id, created.branch, false, None, &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    let response: Value = serde_json::from_str(&history[2].text).unwrap();
    assert!(response["error"].as_str().unwrap().contains("declined"));
    assert_eq!(history[3].text, "understood, skipping");
}

#[tokio::test]
async fn branch_edit_forks_without_switching_primary() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![Part::Text("M1".into())]);
    provider.push_one_shot("Chat");
    provider.push_parts(vec![Part::Text("M2".into())]);
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);
    engine
        .user_turn(&created.id, Some(created.branch), "U1", Vec::new(), &writer)
        .await
        .unwrap();
    engine
        .user_turn(&created.id, Some(created.branch), "U2", Vec::new(), &writer)
        .await
        .unwrap();

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    let u2 = history
        .iter()
        .find(|m| m.text == "U2")
        .expect("U2 persisted");
    let m1 = history.iter().find(|m| m.text == "M1").unwrap();
    let u2_id = u2.id;
    let m1_id = m1.id;
    drop(handle);

    provider.push_parts(vec![Part::Text("M2'".into())]);
    let (fork, outcome) = angel_core::branch_ops::fork_and_rerun(
        &engine,
        &created.id,
        u2_id,
        Some("U2'"),
        &writer,
    )
    .await
    .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let handle = engine.acquire(&created.id).unwrap();
    let fork_row = handle.require_branch(fork).unwrap();
    // The fork hangs off U2's parent, the model message before it.
    assert_eq!(fork_row.branch_from_message_id, Some(m1_id));
    assert_eq!(fork_row.parent_branch_id, Some(created.branch));

    let fork_history = handle.branch_history(fork).unwrap();
    let texts: Vec<_> = fork_history.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["U1", "M1", "U2'", "M2'"]);

    // Primary branch unchanged until the client switches it.
    let row = handle.require_session("").unwrap();
    assert_eq!(row.primary_branch_id, created.branch);
    drop(handle);

    engine.switch_primary(&created.id, fork).unwrap();
    let handle = engine.acquire(&created.id).unwrap();
    assert_eq!(handle.require_session("").unwrap().primary_branch_id, fork);
}

#[tokio::test]
async fn blob_lifecycle_from_attachment_to_session_delete() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![Part::Text("nice image".into())]);
    provider.push_one_shot("Image chat");
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);
    engine
        .user_turn(
            &created.id,
            Some(created.branch),
            "look at this",
            vec![angel_core::IncomingAttachment {
                file_name: "cat.png".into(),
                mime_type: "image/png".into(),
                data: b"fake png bytes".to_vec(),
            }],
            &writer,
        )
        .await
        .unwrap();

    let hash = angel_core::blob_hash(b"fake png bytes");
    let handle = engine.acquire(&created.id).unwrap();
    assert_eq!(handle.blob_ref_count(&hash).unwrap(), Some(1));
    assert_eq!(engine.blob_bytes(&created.id, &hash).unwrap(), b"fake png bytes");
    drop(handle);

    // /clearblobs hides the bytes from the LLM view but keeps the row.
    engine.run_command(&created.id, "clearblobs", None).unwrap();
    let handle = engine.acquire(&created.id).unwrap();
    assert_eq!(handle.blob_ref_count(&hash).unwrap(), Some(1));
    let history = handle.branch_history(created.branch).unwrap();
    let with_attachment = history
        .iter()
        .find(|m| !m.attachments.is_empty())
        .unwrap();
    assert!(with_attachment.attachments[0].omitted);
    drop(handle);

    // Deleting the session removes the database file and the catalog rows.
    engine.delete_session(&created.id).unwrap();
    assert!(engine.main().get_session(&created.id).unwrap().is_none());
    let db_path = engine
        .config()
        .sessions_dir()
        .join(format!("{}.db", created.id.db_key()));
    assert!(!db_path.exists());
}

#[tokio::test]
async fn compression_on_demand_rejects_inflation() {
    let provider = Arc::new(ScriptedProvider::new());
    let (_dir, engine) = build_engine(Arc::clone(&provider));
    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);

    for i in 0..3 {
        provider.push_parts(vec![Part::Text(format!(
            "answer {i} {}",
            "padding ".repeat(40)
        ))]);
        if i == 0 {
            provider.push_one_shot("Long chat");
        }
        engine
            .user_turn(
                &created.id,
                Some(created.branch),
                &format!("question {i} {}", "filler ".repeat(40)),
                Vec::new(),
                &writer,
            )
            .await
            .unwrap();
    }

    provider.push_one_shot(format!(
        "<state_snapshot>{}</state_snapshot>",
        "bloated summary ".repeat(500)
    ));
    let handle = engine.acquire(&created.id).unwrap();
    let before = handle.message_count("").unwrap();
    drop(handle);

    let err = engine.compress(&created.id).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    let handle = engine.acquire(&created.id).unwrap();
    assert_eq!(handle.message_count("").unwrap(), before);
}

#[tokio::test]
async fn retry_error_drops_trailing_errors_and_resumes() {
    let provider = Arc::new(ScriptedProvider::new());
    let (_dir, engine) = build_engine(Arc::clone(&provider));
    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);

    // No scripted turn queued: the provider fails, a model-error lands.
    let outcome = engine
        .user_turn(&created.id, Some(created.branch), "hi", Vec::new(), &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Failed);

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    assert_eq!(history.last().unwrap().kind, MessageKind::ModelError);
    drop(handle);

    provider.push_parts(vec![Part::Text("recovered".into())]);
    provider.push_one_shot("Recovered chat");
    let outcome = engine
        .retry_error(&created.id, created.branch, &writer)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    let row_kinds: Vec<_> = history.iter().map(|m| m.kind).collect();
    assert_eq!(
        row_kinds,
        vec![MessageKind::UserText, MessageKind::ModelText]
    );
    assert_eq!(history[1].text, "recovered");
}

#[tokio::test]
async fn extraction_copies_path_and_blobs() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![Part::Text("reply one".into())]);
    provider.push_one_shot("Chat");
    provider.push_parts(vec![Part::Text("reply two".into())]);
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);
    engine
        .user_turn(
            &created.id,
            Some(created.branch),
            "first",
            vec![angel_core::IncomingAttachment {
                file_name: "doc.txt".into(),
                mime_type: "text/plain".into(),
                data: b"document".to_vec(),
            }],
            &writer,
        )
        .await
        .unwrap();
    engine
        .user_turn(&created.id, Some(created.branch), "second", Vec::new(), &writer)
        .await
        .unwrap();

    let handle = engine.acquire(&created.id).unwrap();
    let history = handle.branch_history(created.branch).unwrap();
    let cutoff = history[1].id; // extract up to the first model reply
    drop(handle);

    let extracted = engine.extract(&created.id, cutoff).unwrap();
    let handle = engine.acquire(&extracted).unwrap();
    let copied = handle.branch_history(handle.auto_detect_branch("").unwrap()).unwrap();
    let texts: Vec<_> = copied.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "reply one"]);

    // The attachment's blob came along via the refcount triggers.
    let hash = angel_core::blob_hash(b"document");
    assert_eq!(handle.blob_ref_count(&hash).unwrap(), Some(1));
}

#[tokio::test]
async fn engine_invariants_hold_after_mixed_operations() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_parts(vec![Part::Text("a1".into())]);
    provider.push_one_shot("Ops");
    provider.push_parts(vec![Part::Text("a2".into())]);
    provider.push_parts(vec![Part::Text("a2'".into())]);
    let (_dir, engine) = build_engine(Arc::clone(&provider));

    let created = engine.create_session(CreateSessionOptions::default()).unwrap();
    let writer = broker().writer(&created.id);
    engine
        .user_turn(&created.id, Some(created.branch), "q1", Vec::new(), &writer)
        .await
        .unwrap();
    engine
        .user_turn(&created.id, Some(created.branch), "q2", Vec::new(), &writer)
        .await
        .unwrap();

    let handle = engine.acquire(&created.id).unwrap();
    let q2 = handle
        .branch_history(created.branch)
        .unwrap()
        .into_iter()
        .find(|m| m.text == "q2")
        .unwrap();
    drop(handle);
    angel_core::branch_ops::fork_and_rerun(&engine, &created.id, q2.id, Some("q2 edited"), &writer)
        .await
        .unwrap();

    let handle = engine.acquire(&created.id).unwrap();
    check_invariants(&handle, &created.id);
}

/// Structural invariants: parent lineage, refcount equality, chosen-next
/// acyclicity, and search-index coverage of indexed rows.
fn check_invariants(db: &angel_core::SessionDb, _session: &SessionId) {
    db.with_conn(|conn| {
        // Every parent is in the same session.
        let orphans: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             LEFT JOIN messages p ON p.id = m.parent_id
             WHERE m.parent_id IS NOT NULL
               AND (p.id IS NULL OR p.session_id != m.session_id)",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(orphans, 0, "message parent outside its session");

        // Refcount equals the attachment references from live messages.
        let mismatches: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blobs b
             WHERE b.ref_count != (
                SELECT COUNT(*) FROM messages m, json_each(COALESCE(m.attachments, '[]')) a
                WHERE json_extract(a.value, '$.hash') = b.hash
             )",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(mismatches, 0, "blob refcount out of sync");

        let zeroes: i64 =
            conn.query_row("SELECT COUNT(*) FROM blobs WHERE ref_count <= 0", [], |row| {
                row.get(0)
            })?;
        assert_eq!(zeroes, 0, "zero-refcount blob row exists");
        Ok(())
    })
    .unwrap();

    // Chosen-next walks visit each message at most once.
    for local in db.all_local_ids().unwrap() {
        db.primary_path(&local).unwrap();
    }
}
