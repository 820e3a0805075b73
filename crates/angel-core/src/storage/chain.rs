//! Message chain
//!
//! Appends messages to the end of a branch while maintaining parent and
//! chosen-next links. The chain remembers the most recent message on the
//! branch so consecutive appends do not re-query the tail.

use crate::error::AngelResult;
use crate::storage::message::{MessageRecord, NewMessage};
use crate::storage::session_db::SessionDb;
use crate::types::{BranchId, MessageId};

/// Append cursor for one branch of one session
pub struct MessageChain<'a> {
    db: &'a SessionDb,
    local_id: String,
    branch: BranchId,
    last_id: Option<MessageId>,
    last_model: Option<String>,
    env_generation: i64,
}

impl<'a> MessageChain<'a> {
    /// Position the chain at the end of `branch`. A fresh branch starts at
    /// its fork message; the root branch starts empty.
    pub fn load(db: &'a SessionDb, local_id: &str, branch: BranchId) -> AngelResult<Self> {
        let (last_id, last_model, env_generation) = match db.last_message(branch)? {
            Some(last) => (Some(last.id), last.model.clone(), last.env_generation),
            None => {
                let row = db.require_branch(branch)?;
                match row.branch_from_message_id {
                    Some(fork) => {
                        let fork_msg = db.require_message(fork)?;
                        (Some(fork), fork_msg.model.clone(), fork_msg.env_generation)
                    }
                    None => (None, None, 0),
                }
            }
        };
        Ok(Self {
            db,
            local_id: local_id.to_string(),
            branch,
            last_id,
            last_model,
            env_generation,
        })
    }

    pub fn branch(&self) -> BranchId {
        self.branch
    }

    pub fn last_id(&self) -> Option<MessageId> {
        self.last_id
    }

    /// Model that produced the most recent message, if any
    pub fn last_model(&self) -> Option<&str> {
        self.last_model.as_deref()
    }

    /// Environment generation at the chain tail
    pub fn env_generation(&self) -> i64 {
        self.env_generation
    }

    /// Append one message: insert with parent = last, redirect the previous
    /// chosen-next, bump the session timestamp, seed chosen-first for a
    /// root. All in one transaction; failure reverts.
    pub fn add(&mut self, msg: NewMessage, now: i64) -> AngelResult<MessageRecord> {
        let record = self
            .db
            .append_message(&self.local_id, self.branch, self.last_id, &msg, now)?;
        self.last_id = Some(record.id);
        if record.model.is_some() {
            self.last_model = record.model.clone();
        }
        self.env_generation = record.env_generation;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::main_db::MainDb;
    use crate::storage::message::MessageKind;

    fn open() -> (tempfile::TempDir, SessionDb) {
        let dir = tempfile::tempdir().unwrap();
        let _main = MainDb::open(&dir.path().join("angel.db")).unwrap();
        let sdb = SessionDb::open(
            &dir.path().join("sessions"),
            "chain",
            &dir.path().join("angel.db"),
        )
        .unwrap();
        (dir, sdb)
    }

    #[test]
    fn test_chain_links_messages() {
        let (_dir, sdb) = open();
        let branch = sdb.create_session("", None, None, None, 1).unwrap();
        let mut chain = MessageChain::load(&sdb, "", branch).unwrap();
        assert_eq!(chain.last_id(), None);

        let a = chain.add(NewMessage::new(MessageKind::UserText, "a"), 2).unwrap();
        let b = chain
            .add(
                NewMessage::new(MessageKind::ModelText, "b").with_model("test-model"),
                3,
            )
            .unwrap();
        let c = chain.add(NewMessage::new(MessageKind::UserText, "c"), 4).unwrap();

        assert_eq!(sdb.require_message(a.id).unwrap().chosen_next_id, Some(b.id));
        assert_eq!(sdb.require_message(b.id).unwrap().chosen_next_id, Some(c.id));
        assert_eq!(chain.last_model(), Some("test-model"));
    }

    #[test]
    fn test_chain_reload_resumes_tail() {
        let (_dir, sdb) = open();
        let branch = sdb.create_session("", None, None, None, 1).unwrap();
        {
            let mut chain = MessageChain::load(&sdb, "", branch).unwrap();
            chain.add(NewMessage::new(MessageKind::UserText, "first"), 2).unwrap();
        }
        let mut chain = MessageChain::load(&sdb, "", branch).unwrap();
        assert!(chain.last_id().is_some());
        let second = chain
            .add(NewMessage::new(MessageKind::UserText, "second"), 3)
            .unwrap();
        assert!(second.parent_id.is_some());
    }

    #[test]
    fn test_chain_on_fresh_fork_starts_at_fork_message() {
        let (_dir, sdb) = open();
        let root = sdb.create_session("", None, None, None, 1).unwrap();
        let mut chain = MessageChain::load(&sdb, "", root).unwrap();
        let u1 = chain.add(NewMessage::new(MessageKind::UserText, "u1"), 2).unwrap();

        let fork = sdb.create_branch(u1.id, 3).unwrap();
        let mut chain = MessageChain::load(&sdb, "", fork.id).unwrap();
        assert_eq!(chain.last_id(), Some(u1.id));

        let head = chain.add(NewMessage::new(MessageKind::UserText, "u1'"), 4).unwrap();
        assert_eq!(head.parent_id, Some(u1.id));
        assert_eq!(head.branch_id, fork.id);
    }
}
