//! Role-tagged chat log with optimistic appends and exact rollback.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered log of turns; insertion order is chronological order.
///
/// A completed exchange never leaves two `user` turns at the tail. When an
/// exchange fails, the unanswered prompt is removed so the caller can retry
/// without orphaned turns accumulating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::user(text));
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::assistant(text));
    }

    /// Removes the trailing turn if it is a `user` turn.
    ///
    /// Returns `false` without touching the log when it is empty or already
    /// ends with an assistant reply, so racing rollbacks after one failure are
    /// harmless.
    pub fn rollback_last_user(&mut self) -> bool {
        match self.turns.last() {
            Some(turn) if turn.role == Role::User => {
                self.turns.pop();
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.clone()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn reset(&mut self) {
        self.turns.clear();
    }

    /// Runs one exchange around `op`.
    ///
    /// The prompt is appended first and `op` sees the log including it. On
    /// success the assistant text returned by `op` is appended; on failure the
    /// prompt is rolled back and the error is returned unchanged.
    pub fn transact<T, E, F>(&mut self, prompt: impl Into<String>, op: F) -> Result<T, E>
    where
        F: FnOnce(&[ConversationTurn]) -> Result<(T, String), E>,
    {
        self.append_user(prompt);
        match op(&self.turns) {
            Ok((value, reply)) => {
                self.append_assistant(reply);
                Ok(value)
            }
            Err(err) => {
                self.rollback_last_user();
                Err(err)
            }
        }
    }
}
