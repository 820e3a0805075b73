//! Buffered SSE decoder for provider streams
//!
//! Handles multi-line data fields, event type prefixes, and incomplete
//! chunks across network boundaries, for both Gemini (`alt=sse`) and
//! OpenAI (`[DONE]`-terminated) framings.

/// A parsed SSE event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// OpenAI end-of-stream marker
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Stateful decoder; feed raw bytes, get complete events
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk and drain every event it completes.
    /// Incomplete trailing data stays buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut events = Vec::new();
        loop {
            let boundary = match (self.buffer.find("\n\n"), self.buffer.find("\r\n\r\n")) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let Some(end) = boundary else { break };
            let raw: String = self.buffer.drain(..end).collect();
            while self.buffer.starts_with('\n') || self.buffer.starts_with('\r') {
                self.buffer.remove(0);
            }
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }
        events
    }

    pub fn has_remaining(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_start();
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // id:, retry:, comments, and unknown fields are ignored.
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event_type,
        data: data_lines.join("\n"),
    })
}
