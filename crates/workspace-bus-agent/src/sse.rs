//! Incremental decoder for `text/event-stream` bodies.
//!
//! Only `data:` fields matter to the agent protocol; comments, `event:`,
//! `id:` and `retry:` lines are skipped.

use workspace_bus_core::{AgentError, AgentEvent};

/// Splits a byte stream into SSE event payloads.
///
/// Network chunks may end anywhere, including inside a line or between the
/// `\r` and `\n` of a CRLF pair.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: String,
    has_data: bool,
}

impl SseDecoder {
    /// Create a decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the data of every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(rel) = self.buffer[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            let pos = start + rel;
            let next = if self.buffer[pos] == b'\r' {
                match self.buffer.get(pos + 1) {
                    Some(b'\n') => pos + 2,
                    Some(_) => pos + 1,
                    // Lone CR at the end: wait to see whether LF follows
                    None => break,
                }
            } else {
                pos + 1
            };

            let line = String::from_utf8_lossy(&self.buffer[start..pos]).into_owned();
            start = next;
            if let Some(data) = self.process_line(&line) {
                events.push(data);
            }
        }

        self.buffer.drain(..start);
        events
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_owned();
            if let Some(data) = self.process_line(&line) {
                return Some(data);
            }
        }
        self.take_event()
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        if field == "data" {
            if self.has_data {
                self.data.push('\n');
            }
            self.data.push_str(value.strip_prefix(' ').unwrap_or(value));
            self.has_data = true;
        }
        None
    }

    fn take_event(&mut self) -> Option<String> {
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(std::mem::take(&mut self.data))
    }
}

/// Decode one event payload into an agent frame.
///
/// Returns `None` for the `[DONE]` sentinel and blank payloads, and
/// `Some(Err(AgentError::Parse))` for payloads that are not valid frames.
#[must_use]
pub fn decode_event(data: &str) -> Option<Result<AgentEvent, AgentError>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(serde_json::from_str(data).map_err(|e| AgentError::Parse(format!("{e}: {data}"))))
}

/// Decode every frame carried by one event payload.
///
/// A payload joined from several `data:` lines is first tried as a single
/// frame. When that fails each line is decoded on its own, so a malformed
/// line costs only itself and its valid neighbours still come through.
#[must_use]
pub fn decode_events(data: &str) -> Vec<Result<AgentEvent, AgentError>> {
    match decode_event(data) {
        Some(Err(_)) if data.contains('\n') => data.lines().filter_map(decode_event).collect(),
        decoded => decoded.into_iter().collect(),
    }
}
