//! Pull-style delivery of streamed chat increments.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relay_contracts::stream::StreamDecoder;
use tracing::debug;

use crate::error::{RelayError, RelayResult};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Shared abort flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Iterator over the text increments of one streamed response.
///
/// Reads the body chunk by chunk and yields increments as the decoder emits
/// them. Single pass: once it returns `None` it stays exhausted. A
/// cancellation yields one `Err(Cancelled)` and then ends.
pub struct DeltaStream<R: Read> {
    reader: R,
    decoder: StreamDecoder,
    cancel: CancelToken,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    deferred: Option<RelayError>,
    collected: String,
    finished: bool,
}

impl<R: Read> DeltaStream<R> {
    pub fn new(reader: R, cancel: CancelToken) -> Self {
        Self {
            reader,
            decoder: StreamDecoder::new(),
            cancel,
            buf: vec![0; READ_CHUNK_BYTES],
            pending: VecDeque::new(),
            deferred: None,
            collected: String::new(),
            finished: false,
        }
    }

    /// Text yielded so far.
    pub fn collected(&self) -> &str {
        &self.collected
    }

    /// Drives the stream to completion, handing each increment to `sink`, and
    /// returns the full text.
    pub fn drain_into<F>(mut self, sink: &mut F) -> RelayResult<String>
    where
        F: FnMut(&str),
    {
        while let Some(item) = self.next() {
            sink(&item?);
        }
        Ok(self.collected)
    }

    fn fill(&mut self) -> Option<RelayError> {
        let pending = &mut self.pending;
        let mut push = |delta: &str| pending.push_back(delta.to_string());
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    return self.decoder.finish(&mut push).err().map(RelayError::from);
                }
                Ok(read) => {
                    return self
                        .decoder
                        .feed(&self.buf[..read], &mut push)
                        .err()
                        .map(RelayError::from);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Some(RelayError::NetworkFailure(format!(
                        "stream read failed: {err}"
                    )));
                }
            }
        }
    }
}

impl<R: Read> Iterator for DeltaStream<R> {
    type Item = RelayResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                debug!(pending = self.pending.len(), "stream cancelled by caller");
                self.finished = true;
                self.pending.clear();
                return Some(Err(RelayError::Cancelled));
            }
            if let Some(delta) = self.pending.pop_front() {
                self.collected.push_str(&delta);
                return Some(Ok(delta));
            }
            if let Some(err) = self.deferred.take() {
                self.finished = true;
                return Some(Err(err));
            }
            if self.decoder.is_terminal() {
                self.finished = true;
                return None;
            }
            self.deferred = self.fill();
        }
    }
}
