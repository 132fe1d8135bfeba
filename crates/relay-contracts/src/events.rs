use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One request lifecycle event. Serialized with a snake_case `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeEvent {
    ExchangeStarted {
        endpoint: String,
        model: String,
    },
    ExchangeCompleted {
        endpoint: String,
        model: String,
        elapsed_ms: u64,
        reply_kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chars: Option<usize>,
        #[serde(default)]
        streamed: bool,
    },
    ExchangeFailed {
        endpoint: String,
        model: String,
        elapsed_ms: u64,
        code: String,
        message: String,
    },
    RateLimited {
        endpoint: String,
        wait_ms: u64,
    },
    ImagePrepared {
        original_size: usize,
        size: usize,
        width: u32,
        height: u32,
        iterations: usize,
        reencoded: bool,
    },
}

impl ExchangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeEvent::ExchangeStarted { .. } => "exchange_started",
            ExchangeEvent::ExchangeCompleted { .. } => "exchange_completed",
            ExchangeEvent::ExchangeFailed { .. } => "exchange_failed",
            ExchangeEvent::RateLimited { .. } => "rate_limited",
            ExchangeEvent::ImagePrepared { .. } => "image_prepared",
        }
    }
}

/// A journal line: the event plus session id and RFC 3339 timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub session_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub event: ExchangeEvent,
}

/// Append-only JSONL journal, one compact entry per line. Clones share the
/// file and the write lock.
#[derive(Debug, Clone)]
pub struct ExchangeJournal {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    session_id: String,
    write_lock: Mutex<()>,
}

impl ExchangeJournal {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                session_id: session_id.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn record(&self, event: ExchangeEvent) -> anyhow::Result<JournalEntry> {
        let entry = JournalEntry {
            session_id: self.shared.session_id.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let path = &self.shared.path;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let _guard = self
            .shared
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("exchange journal lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(entry)
    }
}

/// Reads every entry of a journal file, failing on the first malformed line.
pub fn read_journal(path: &Path) -> anyhow::Result<Vec<JournalEntry>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{} line {} is not a journal entry", path.display(), index + 1))
        })
        .collect()
}
