//! Request assembly: stored rows → curated history → provider contents

use crate::error::AngelResult;
use crate::history::{curate, omitted_attachment_note, CurationOptions};
use crate::llm::provider::{Content, Part};
use crate::storage::message::{MessageKind, MessageRecord};
use crate::storage::session_db::SessionDb;
use crate::types::BranchId;

/// History of one branch as the next turn should see it: the branch walk,
/// with the prefix replaced by the latest compression summary that covers
/// it.
pub fn turn_history(db: &SessionDb, branch: BranchId) -> AngelResult<Vec<MessageRecord>> {
    let mut history = db.branch_history(branch)?;
    // The newest compression whose chosen-next lands on this path replaces
    // everything before its splice point.
    let mut splice: Option<(usize, MessageRecord)> = None;
    for record in history.iter().rev() {
        if record.kind != MessageKind::Compression {
            continue;
        }
        if let Some(target) = record.chosen_next_id {
            if let Some(idx) = history.iter().position(|m| m.id == target) {
                splice = Some((idx, record.clone()));
                break;
            }
        }
    }
    if splice.is_none() {
        // Compression rows are parentless, so they may live outside the
        // branch walk entirely; check the session's roots too.
        let roots = history.first().map(|m| m.session_id.clone());
        if let Some(session_id) = roots {
            for record in db.compression_messages(&session_id)?.into_iter().rev() {
                if let Some(target) = record.chosen_next_id {
                    if let Some(idx) = history.iter().position(|m| m.id == target) {
                        splice = Some((idx, record));
                        break;
                    }
                }
            }
        }
    }
    if let Some((idx, compression)) = splice {
        let mut spliced = Vec::with_capacity(history.len() - idx + 1);
        spliced.push(compression);
        spliced.extend(history.drain(idx..).filter(|m| m.kind != MessageKind::Compression));
        history = spliced;
    } else {
        history.retain(|m| m.kind != MessageKind::Compression);
    }
    Ok(history)
}

/// Curate and convert to provider contents, loading attachment bytes from
/// the session database. Omitted attachments render as a recall reminder
/// instead of their bytes.
pub fn contents_for_request(
    db: &SessionDb,
    history: &[MessageRecord],
    opts: CurationOptions,
) -> AngelResult<Vec<Content>> {
    let curated = curate(history, opts);
    let mut contents = Vec::with_capacity(curated.len());
    for record in &curated {
        let content = match record.kind {
            MessageKind::UserText => {
                let mut parts = vec![Part::Text(record.text.clone())];
                append_attachment_parts(db, record, &mut parts)?;
                Content::user(parts)
            }
            MessageKind::ModelText => {
                let mut parts = vec![Part::Text(record.text.clone())];
                append_attachment_parts(db, record, &mut parts)?;
                Content::model(parts)
            }
            MessageKind::Thought => Content::model(vec![Part::Thought(record.text.clone())]),
            MessageKind::FunctionCall => {
                let (name, args) = parse_call(&record.text);
                Content::model(vec![Part::FunctionCall { name, args }])
            }
            MessageKind::FunctionResponse => {
                let (name, response) = parse_response(&record.text);
                let mut parts = vec![Part::FunctionResponse { name, response }];
                append_attachment_parts(db, record, &mut parts)?;
                Content::user(parts)
            }
            MessageKind::Compression => Content::user(vec![Part::Text(format!(
                "Summary of the conversation so far:\n{}",
                record.text
            ))]),
            // Errors only appear when explicitly requested.
            MessageKind::ModelError | MessageKind::Error => {
                Content::model(vec![Part::Text(record.text.clone())])
            }
            // Already re-materialized by curation.
            MessageKind::SystemPrompt | MessageKind::EnvChange | MessageKind::Command => continue,
        };
        contents.push(content);
    }
    Ok(contents)
}

fn append_attachment_parts(
    db: &SessionDb,
    record: &MessageRecord,
    parts: &mut Vec<Part>,
) -> AngelResult<()> {
    for attachment in &record.attachments {
        if attachment.omitted {
            parts.push(Part::Text(omitted_attachment_note(attachment)));
            continue;
        }
        match db.blob(&attachment.hash)? {
            Some(data) => parts.push(Part::InlineData {
                mime_type: attachment.mime_type.clone(),
                data,
            }),
            None => parts.push(Part::Text(omitted_attachment_note(attachment))),
        }
    }
    Ok(())
}

fn parse_call(text: &str) -> (String, serde_json::Map<String, serde_json::Value>) {
    let value: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    (
        value["name"].as_str().unwrap_or_default().to_string(),
        value["args"].as_object().cloned().unwrap_or_default(),
    )
}

fn parse_response(text: &str) -> (String, serde_json::Value) {
    let value: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    let name = value["name"].as_str().unwrap_or_default().to_string();
    let response = value
        .get("response")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    (name, response)
}

/// Role of the last content, used by the loop-continuation check
pub fn ends_with_function_response(history: &[MessageRecord]) -> bool {
    history
        .last()
        .map(|m| m.kind == MessageKind::FunctionResponse)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Role;
    use crate::storage::main_db::MainDb;
    use crate::storage::message::{Attachment, NewMessage};

    fn open() -> (tempfile::TempDir, SessionDb) {
        let dir = tempfile::tempdir().unwrap();
        let _main = MainDb::open(&dir.path().join("angel.db")).unwrap();
        let sdb = SessionDb::open(
            &dir.path().join("sessions"),
            "asm",
            &dir.path().join("angel.db"),
        )
        .unwrap();
        (dir, sdb)
    }

    #[test]
    fn test_contents_map_roles_and_calls() {
        let (_dir, sdb) = open();
        let branch = sdb.create_session("", None, None, None, 1).unwrap();
        let u = sdb
            .append_message("", branch, None, &NewMessage::new(MessageKind::UserText, "read it"), 1)
            .unwrap();
        let call = sdb
            .append_message(
                "",
                branch,
                Some(u.id),
                &NewMessage::new(
                    MessageKind::FunctionCall,
                    r#"{"name":"read_file","args":{"file_path":"a"}}"#,
                ),
                2,
            )
            .unwrap();
        sdb.append_message(
            "",
            branch,
            Some(call.id),
            &NewMessage::new(
                MessageKind::FunctionResponse,
                r#"{"name":"read_file","response":{"content":"x"}}"#,
            ),
            3,
        )
        .unwrap();

        let history = turn_history(&sdb, branch).unwrap();
        let contents = contents_for_request(&sdb, &history, CurationOptions::default()).unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].role, Role::User);
        assert!(matches!(contents[1].parts[0], Part::FunctionCall { .. }));
        assert!(matches!(contents[2].parts[0], Part::FunctionResponse { .. }));
    }

    #[test]
    fn test_attachment_bytes_inlined_and_omitted_noted() {
        let (_dir, sdb) = open();
        let branch = sdb.create_session("", None, None, None, 1).unwrap();
        let hash = sdb.save_blob(b"imgdata").unwrap();
        let msg = NewMessage::new(MessageKind::UserText, "see image").with_attachments(vec![
            Attachment {
                hash: hash.clone(),
                file_name: "i.png".into(),
                mime_type: "image/png".into(),
                omitted: false,
            },
        ]);
        let m = sdb.append_message("", branch, None, &msg, 1).unwrap();

        let history = turn_history(&sdb, branch).unwrap();
        let contents = contents_for_request(&sdb, &history, CurationOptions::default()).unwrap();
        assert!(matches!(&contents[0].parts[1], Part::InlineData { data, .. } if data == b"imgdata"));

        sdb.mark_attachments_omitted("", crate::types::MessageId(m.id.0 + 1)).unwrap();
        let history = turn_history(&sdb, branch).unwrap();
        let contents = contents_for_request(&sdb, &history, CurationOptions::default()).unwrap();
        match &contents[0].parts[1] {
            Part::Text(note) => assert!(note.contains(&hash)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_turn_history_splices_compression() {
        let (_dir, sdb) = open();
        let branch = sdb.create_session("", None, None, None, 1).unwrap();
        let u1 = sdb
            .append_message("", branch, None, &NewMessage::new(MessageKind::UserText, "old"), 1)
            .unwrap();
        let m1 = sdb
            .append_message("", branch, Some(u1.id), &NewMessage::new(MessageKind::ModelText, "old reply"), 2)
            .unwrap();
        let u2 = sdb
            .append_message("", branch, Some(m1.id), &NewMessage::new(MessageKind::UserText, "kept"), 3)
            .unwrap();

        // Parentless compression row pointing at the kept tail.
        let comp = sdb
            .append_message("", branch, None, &NewMessage::new(MessageKind::Compression, "summary"), 4)
            .unwrap();
        sdb.set_chosen_next(comp.id, Some(u2.id)).unwrap();

        let history = turn_history(&sdb, branch).unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["summary", "kept"]);
    }
}
