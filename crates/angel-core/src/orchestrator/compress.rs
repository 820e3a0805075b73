//! History compression
//!
//! Replaces the head of a long conversation with a model-written state
//! snapshot. Compression that would not strictly reduce the token estimate
//! is a no-op, never a regression.

use crate::error::{AngelError, AngelResult};
use crate::history::CurationOptions;
use crate::llm::provider::{estimate_tokens, Content, GenerateParams, Provider};
use crate::orchestrator::assemble::{contents_for_request, turn_history};
use crate::storage::message::{MessageKind, MessageRecord, NewMessage};
use crate::storage::session_db::SessionDb;
use crate::types::BranchId;

/// Share of the context window that triggers the guard in the turn loop
pub const COMPRESSION_TRIGGER_RATIO: f64 = 0.7;

/// Minimum share of characters that must survive in the keep tail
const KEEP_TAIL_RATIO: f64 = 0.3;

const SUMMARIZATION_PROMPT: &str = "Summarize the conversation above into a compact state \
snapshot that preserves every fact, decision, open task, and file path a future turn could \
need. Write the snapshot between <state_snapshot> and </state_snapshot> tags.";

/// Result of a successful compression
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub pre_tokens: u64,
    pub post_tokens: u64,
    pub compressed_messages: usize,
}

/// Compress the head of `branch`, leaving a tail that starts at a user
/// message and holds at least 30 % of the serialized characters.
pub async fn compress_session(
    db: &SessionDb,
    provider: &dyn Provider,
    model: &str,
    local_id: &str,
    branch: BranchId,
    now: i64,
) -> AngelResult<CompressionOutcome> {
    let history = turn_history(db, branch)?;
    let curated = crate::history::curate(&history, CurationOptions::default());
    let split = find_split(&curated).ok_or_else(|| {
        AngelError::validation("conversation is too short to compress")
    })?;

    let head = &curated[..split];
    let tail = &curated[split..];

    let mut contents = contents_for_request(db, head, CurationOptions::default())?;
    contents.push(Content::user_text(SUMMARIZATION_PROMPT));
    let params = GenerateParams {
        contents,
        ..Default::default()
    };
    let raw = provider.generate_one_shot(model, &params).await?;
    let summary = extract_snapshot(&raw);

    let pre_contents = contents_for_request(db, &curated, CurationOptions::default())?;
    let mut post_contents = vec![Content::user_text(summary.clone())];
    post_contents.extend(contents_for_request(db, tail, CurationOptions::default())?);
    let pre_tokens = estimate_tokens(&pre_contents);
    let post_tokens = estimate_tokens(&post_contents);
    if post_tokens >= pre_tokens {
        return Err(AngelError::validation(format!(
            "compression would inflate the history ({pre_tokens} -> {post_tokens} tokens)"
        )));
    }

    let first_kept = tail
        .first()
        .map(|m| m.id)
        .ok_or_else(|| AngelError::validation("conversation is too short to compress"))?;
    let summary_tokens = estimate_tokens(&[Content::user_text(summary.clone())]) as i64;

    // One transaction: insert the summary row, splice chosen-next, and
    // rebase the tail's cumulative token counts on the summary.
    let compression = db.append_message(
        local_id,
        branch,
        None,
        &NewMessage::new(MessageKind::Compression, summary).with_token_delta(summary_tokens),
        now,
    )?;
    db.set_chosen_next(compression.id, Some(first_kept))?;
    db.rebase_cumulative_tokens(first_kept, summary_tokens)?;

    tracing::info!(
        session = local_id,
        %branch,
        pre_tokens,
        post_tokens,
        "history compressed"
    );
    Ok(CompressionOutcome {
        pre_tokens,
        post_tokens,
        compressed_messages: split,
    })
}

/// Largest head that leaves ≥ 30 % of characters in the tail, advanced so
/// the tail starts at a user message. `None` when no valid split exists.
fn find_split(curated: &[MessageRecord]) -> Option<usize> {
    if curated.len() < 2 {
        return None;
    }
    let lengths: Vec<usize> = curated
        .iter()
        .map(|m| serde_json::to_string(m).map(|s| s.chars().count()).unwrap_or(0))
        .collect();
    let total: usize = lengths.iter().sum();
    if total == 0 {
        return None;
    }
    let budget = (total as f64 * (1.0 - KEEP_TAIL_RATIO)) as usize;

    let mut split = 0;
    let mut consumed = 0;
    for (idx, len) in lengths.iter().enumerate() {
        if consumed + len > budget {
            break;
        }
        consumed += len;
        split = idx + 1;
    }

    // The tail must open with a user turn.
    while split < curated.len() && curated[split].kind != MessageKind::UserText {
        split += 1;
    }
    if split == 0 || split >= curated.len() {
        return None;
    }
    Some(split)
}

/// Text inside `<state_snapshot>…</state_snapshot>`, or the whole response
/// when the model skipped the tags
fn extract_snapshot(raw: &str) -> String {
    let open = "<state_snapshot>";
    let close = "</state_snapshot>";
    match (raw.find(open), raw.find(close)) {
        (Some(start), Some(end)) if start + open.len() <= end => {
            raw[start + open.len()..end].trim().to_string()
        }
        _ => raw.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Part;
    use crate::llm::scripted::ScriptedProvider;
    use crate::storage::main_db::MainDb;

    fn open() -> (tempfile::TempDir, SessionDb) {
        let dir = tempfile::tempdir().unwrap();
        let _main = MainDb::open(&dir.path().join("angel.db")).unwrap();
        let sdb = SessionDb::open(
            &dir.path().join("sessions"),
            "cmp",
            &dir.path().join("angel.db"),
        )
        .unwrap();
        (dir, sdb)
    }

    fn seed_conversation(sdb: &SessionDb) -> BranchId {
        let branch = sdb.create_session("", None, None, None, 1).unwrap();
        let mut parent = None;
        for i in 0..6 {
            let filler = format!("message number {i} with a good amount of padding text {}", "x".repeat(120));
            let kind = if i % 2 == 0 {
                MessageKind::UserText
            } else {
                MessageKind::ModelText
            };
            let m = sdb
                .append_message("", branch, parent, &NewMessage::new(kind, filler).with_token_delta(40), i)
                .unwrap();
            parent = Some(m.id);
        }
        branch
    }

    #[test]
    fn test_extract_snapshot() {
        assert_eq!(
            extract_snapshot("noise <state_snapshot> the facts </state_snapshot> more"),
            "the facts"
        );
        assert_eq!(extract_snapshot("untagged output"), "untagged output");
    }

    #[test]
    fn test_find_split_starts_tail_at_user_message() {
        let (_dir, sdb) = open();
        let branch = seed_conversation(&sdb);
        let history = turn_history(&sdb, branch).unwrap();
        let split = find_split(&history).unwrap();
        assert!(split > 0 && split < history.len());
        assert_eq!(history[split].kind, MessageKind::UserText);
    }

    #[tokio::test]
    async fn test_compression_replaces_head() {
        let (_dir, sdb) = open();
        let branch = seed_conversation(&sdb);
        let provider = ScriptedProvider::new();
        provider.push_one_shot("<state_snapshot>short summary</state_snapshot>");

        let before = sdb.message_count("").unwrap();
        let outcome = compress_session(&sdb, &provider, "m", "", branch, 100)
            .await
            .unwrap();
        assert!(outcome.post_tokens < outcome.pre_tokens);
        assert_eq!(sdb.message_count("").unwrap(), before + 1);

        let history = turn_history(&sdb, branch).unwrap();
        assert_eq!(history[0].kind, MessageKind::Compression);
        assert_eq!(history[0].text, "short summary");
        assert_eq!(history[1].kind, MessageKind::UserText);
        // Tail cumulative counts are rebased on the summary.
        assert_eq!(history[1].cumul_tokens, history[0].cumul_tokens + 40);
    }

    #[tokio::test]
    async fn test_inflating_compression_is_a_no_op() {
        let (_dir, sdb) = open();
        let branch = seed_conversation(&sdb);
        let provider = ScriptedProvider::new();
        provider.push_one_shot(format!(
            "<state_snapshot>{}</state_snapshot>",
            "very long summary ".repeat(200)
        ));

        let before = sdb.message_count("").unwrap();
        let err = compress_session(&sdb, &provider, "m", "", branch, 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(sdb.message_count("").unwrap(), before, "no row may be added");
        let history = turn_history(&sdb, branch).unwrap();
        assert_ne!(history[0].kind, MessageKind::Compression);
    }

    #[tokio::test]
    async fn test_second_compression_supersedes_first() {
        let (_dir, sdb) = open();
        let branch = seed_conversation(&sdb);
        let provider = ScriptedProvider::new();
        provider.push_one_shot("<state_snapshot>first pass</state_snapshot>");
        compress_session(&sdb, &provider, "m", "", branch, 100).await.unwrap();

        // Grow the tail, then compress again.
        let last = sdb.last_message(branch).unwrap().unwrap();
        let mut parent = Some(last.id);
        for i in 0..4 {
            let filler = format!("follow-up {i} {}", "y".repeat(150));
            let kind = if i % 2 == 0 {
                MessageKind::UserText
            } else {
                MessageKind::ModelText
            };
            let m = sdb
                .append_message("", branch, parent, &NewMessage::new(kind, filler), 200 + i)
                .unwrap();
            parent = Some(m.id);
        }
        provider.push_one_shot("<state_snapshot>second pass</state_snapshot>");
        compress_session(&sdb, &provider, "m", "", branch, 300).await.unwrap();

        let history = turn_history(&sdb, branch).unwrap();
        assert_eq!(history[0].text, "second pass");
        assert!(history.iter().filter(|m| m.kind == MessageKind::Compression).count() == 1);
    }
}
