//! Incremental decoder for chat-completion server-sent events.
//!
//! Bytes are buffered until a full line is available, so frames may be split
//! at any byte boundary, including inside a multi-byte UTF-8 sequence.

use serde_json::Value;
use tracing::{debug, trace};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Buffering,
    Dispatching,
    Done,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The upstream put an `error` member in a data frame.
    #[error("upstream stream error: {0}")]
    Upstream(String),
}

/// Single-use decoder; build a new one for every streamed response.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    state: DecoderState,
    emitted: usize,
    skipped: usize,
}

enum LineOutcome {
    Continue,
    Done,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            state: DecoderState::Buffering,
            emitted: 0,
            skipped: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DecoderState::Done | DecoderState::Errored)
    }

    /// Number of increments handed to the sink so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Number of data lines dropped because they were not valid JSON.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Appends `chunk` and dispatches every complete line in the buffer.
    ///
    /// Each text increment goes to `sink` as soon as its line is parsed.
    /// Bytes arriving after the decoder reached `Done` or `Errored` are
    /// dropped.
    pub fn feed<F>(&mut self, chunk: &[u8], sink: &mut F) -> Result<DecoderState, StreamError>
    where
        F: FnMut(&str),
    {
        if self.is_terminal() {
            trace!(
                bytes = chunk.len(),
                state = ?self.state,
                "ignoring bytes after stream end"
            );
            return Ok(self.state);
        }

        self.state = DecoderState::Buffering;
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = buffer[search_from..].iter().position(|byte| *byte == b'\n') {
            let newline = search_from + offset;
            self.state = DecoderState::Dispatching;
            match self.dispatch_line(&buffer[start..newline], sink) {
                Ok(LineOutcome::Continue) => {}
                Ok(LineOutcome::Done) => {
                    self.state = DecoderState::Done;
                    self.scanned = 0;
                    return Ok(self.state);
                }
                Err(err) => {
                    self.state = DecoderState::Errored;
                    self.scanned = 0;
                    return Err(err);
                }
            }
            start = newline + 1;
            search_from = start;
        }

        buffer.drain(..start);
        self.scanned = buffer.len();
        self.buffer = buffer;
        self.state = DecoderState::Buffering;
        Ok(self.state)
    }

    /// Marks the upstream connection as closed.
    ///
    /// A trailing line without a newline is dispatched before the decoder
    /// moves to `Done`.
    pub fn finish<F>(&mut self, sink: &mut F) -> Result<DecoderState, StreamError>
    where
        F: FnMut(&str),
    {
        if self.is_terminal() {
            return Ok(self.state);
        }
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if !rest.is_empty() {
            self.state = DecoderState::Dispatching;
            if let Err(err) = self.dispatch_line(&rest, sink) {
                self.state = DecoderState::Errored;
                return Err(err);
            }
        }
        self.state = DecoderState::Done;
        Ok(self.state)
    }

    fn dispatch_line<F>(&mut self, raw: &[u8], sink: &mut F) -> Result<LineOutcome, StreamError>
    where
        F: FnMut(&str),
    {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() || line.starts_with(':') {
            return Ok(LineOutcome::Continue);
        }
        let Some(data) = line.strip_prefix("data:") else {
            trace!(line = %line, "ignoring non-data field");
            return Ok(LineOutcome::Continue);
        };
        let data = data.strip_prefix(' ').unwrap_or(data).trim_end();
        if data.trim() == DONE_SENTINEL {
            return Ok(LineOutcome::Done);
        }
        if data.trim().is_empty() {
            return Ok(LineOutcome::Continue);
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(err) => {
                self.skipped += 1;
                debug!(error = %err, payload = %truncate(data, 120), "skipping malformed stream frame");
                return Ok(LineOutcome::Continue);
            }
        };

        if let Some(message) = upstream_error_message(&payload) {
            return Err(StreamError::Upstream(message));
        }

        if let Some(delta) = delta_text(&payload) {
            if !delta.is_empty() {
                self.emitted += 1;
                sink(delta);
            }
        }
        Ok(LineOutcome::Continue)
    }
}

/// Text increment carried by one chat-completion chunk, if any.
pub fn delta_text(payload: &Value) -> Option<&str> {
    payload
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
}

fn upstream_error_message(payload: &Value) -> Option<String> {
    match payload.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) => Some(message.clone()),
        Value::Object(map) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
