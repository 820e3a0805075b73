//! Per-session event broadcast and SSE encoding
//!
//! Each session has one process-wide broadcast endpoint; an event writer
//! publishes to it and any number of listeners subscribe. Slow listeners
//! are dropped by the channel, never backpressured. The wire payload is a
//! single leading type character followed by free-form text; multi-line
//! payloads repeat `data: ` on each SSE line, and completion is explicit
//! (`Q`) so clients can tell a finished stream from an interrupted one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::types::SessionId;

/// Event taxonomy with the one-character wire tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Snapshot for a listener joining while a call is in flight
    InitialStateWithCall,
    /// Snapshot when no call is active; the connection closes after it
    InitialState,
    ModelDelta,
    Thought,
    FunctionCall,
    FunctionReply,
    SessionName,
    PendingConfirmation,
    Error,
    GenerationChanged,
    WorkspaceHint,
    Acknowledge,
    Complete,
}

impl EventKind {
    pub fn type_char(&self) -> char {
        match self {
            Self::InitialStateWithCall => '0',
            Self::InitialState => '1',
            Self::ModelDelta => 'M',
            Self::Thought => 'T',
            Self::FunctionCall => 'F',
            Self::FunctionReply => 'R',
            Self::SessionName => 'N',
            Self::PendingConfirmation => 'P',
            Self::Error => 'E',
            Self::GenerationChanged => 'G',
            Self::WorkspaceHint => 'W',
            Self::Acknowledge => 'A',
            Self::Complete => 'Q',
        }
    }
}

/// One broadcast event
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub payload: String,
}

impl SessionEvent {
    pub fn new(kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Encode as one SSE frame: the type character leads the first data
    /// line, continuation lines repeat `data: `
    pub fn encode_sse(&self) -> String {
        let body = format!("{}{}", self.kind.type_char(), self.payload);
        let mut frame = String::with_capacity(body.len() + 16);
        for line in body.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}

struct BrokerEntry {
    tx: broadcast::Sender<SessionEvent>,
    refs: usize,
}

/// Process-wide map of per-session broadcasters
pub struct EventBroker {
    entries: Mutex<HashMap<String, BrokerEntry>>,
}

static BROKER: LazyLock<EventBroker> = LazyLock::new(|| EventBroker {
    entries: Mutex::new(HashMap::new()),
});

/// The global broker
pub fn broker() -> &'static EventBroker {
    &BROKER
}

const CHANNEL_CAPACITY: usize = 256;

impl EventBroker {
    /// Acquire a writer for `session`, creating the broadcaster on first use
    pub fn writer(&'static self, session: &SessionId) -> EventWriter {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session.as_str().to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                BrokerEntry { tx, refs: 0 }
            });
        entry.refs += 1;
        EventWriter {
            broker: self,
            session: session.clone(),
            tx: entry.tx.clone(),
            headers_sent: Arc::new(AtomicBool::new(false)),
            released: AtomicBool::new(false),
        }
    }

    /// Subscribe to a session's live events
    pub fn subscribe(&self, session: &SessionId) -> broadcast::Receiver<SessionEvent> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session.as_str().to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                BrokerEntry { tx, refs: 0 }
            });
        entry.tx.subscribe()
    }

    /// Number of live listeners on a session
    pub fn listener_count(&self, session: &SessionId) -> usize {
        self.entries
            .lock()
            .get(session.as_str())
            .map(|e| e.tx.receiver_count())
            .unwrap_or(0)
    }

    fn release(&self, session: &SessionId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(session.as_str()) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 && entry.tx.receiver_count() == 0 {
                entries.remove(session.as_str());
            }
        }
    }
}

/// Publishing side of one session's broadcast
pub struct EventWriter {
    broker: &'static EventBroker,
    session: SessionId,
    tx: broadcast::Sender<SessionEvent>,
    headers_sent: Arc<AtomicBool>,
    released: AtomicBool,
}

impl EventWriter {
    /// Publish an event; listeners that lag are dropped by the channel.
    /// Returns the number of listeners reached.
    pub fn send(&self, kind: EventKind, payload: impl Into<String>) -> usize {
        self.headers_sent.store(true, Ordering::Relaxed);
        self.tx
            .send(SessionEvent::new(kind, payload))
            .unwrap_or(0)
    }

    /// Whether anything has been sent yet (HTTP header state tracking)
    pub fn headers_sent(&self) -> bool {
        self.headers_sent.load(Ordering::Relaxed)
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Another refcounted writer on the same broadcaster
    pub fn acquire(&self) -> EventWriter {
        self.broker.writer(&self.session)
    }

    /// Release the broadcaster reference; the entry disappears once the
    /// last writer and listener are gone
    pub fn close(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.broker.release(&self.session);
        }
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId(s.to_string())
    }

    #[test]
    fn test_type_chars_match_interface() {
        assert_eq!(EventKind::InitialStateWithCall.type_char(), '0');
        assert_eq!(EventKind::InitialState.type_char(), '1');
        assert_eq!(EventKind::FunctionCall.type_char(), 'F');
        assert_eq!(EventKind::Thought.type_char(), 'T');
        assert_eq!(EventKind::ModelDelta.type_char(), 'M');
        assert_eq!(EventKind::FunctionReply.type_char(), 'R');
        assert_eq!(EventKind::Complete.type_char(), 'Q');
        assert_eq!(EventKind::SessionName.type_char(), 'N');
        assert_eq!(EventKind::Error.type_char(), 'E');
    }

    #[test]
    fn test_sse_encoding_single_line() {
        let event = SessionEvent::new(EventKind::ModelDelta, "hello");
        assert_eq!(event.encode_sse(), "data: Mhello\n\n");
    }

    #[test]
    fn test_sse_encoding_multi_line_repeats_data() {
        let event = SessionEvent::new(EventKind::ModelDelta, "line1\nline2");
        assert_eq!(event.encode_sse(), "data: Mline1\ndata: line2\n\n");
    }

    #[tokio::test]
    async fn test_writer_reaches_subscribers() {
        let session = sid("events-1");
        let mut rx = broker().subscribe(&session);
        let writer = broker().writer(&session);
        assert!(!writer.headers_sent());
        let reached = writer.send(EventKind::ModelDelta, "x");
        assert_eq!(reached, 1);
        assert!(writer.headers_sent());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ModelDelta);
        assert_eq!(event.payload, "x");
    }

    #[tokio::test]
    async fn test_listeners_ordered() {
        let session = sid("events-2");
        let mut rx = broker().subscribe(&session);
        let writer = broker().writer(&session);
        for i in 0..5 {
            writer.send(EventKind::ModelDelta, i.to_string());
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload, i.to_string());
        }
    }

    #[test]
    fn test_release_drops_entry() {
        let session = sid("events-3");
        let writer = broker().writer(&session);
        let second = writer.acquire();
        writer.close();
        writer.close(); // idempotent
        assert_eq!(broker().listener_count(&session), 0);
        second.close();
        assert!(broker().entries.lock().get("events-3").is_none());
    }
}
