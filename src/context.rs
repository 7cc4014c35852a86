//! Bounded record of prior turns, sent along with each generation request.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Error => "error",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub applied_paths: Vec<String>,
    pub at: DateTime<Utc>,
}

/// The most recent `max_turns` entries plus every path applied so far.
///
/// Only the orchestrator appends, after a run completes or fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    max_turns: usize,
    entries: VecDeque<ContextEntry>,
    applied_files: BTreeSet<String>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConversationContext {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            entries: VecDeque::new(),
            applied_files: BTreeSet::new(),
        }
    }

    fn push(&mut self, role: Role, text: impl Into<String>, applied_paths: Vec<String>) {
        self.applied_files.extend(applied_paths.iter().cloned());
        self.entries.push_back(ContextEntry {
            role,
            text: text.into(),
            applied_paths,
            at: Utc::now(),
        });
        while self.entries.len() > self.max_turns {
            self.entries.pop_front();
        }
    }

    pub fn record_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, text, Vec::new());
    }

    pub fn record_assistant(&mut self, text: impl Into<String>, applied_paths: Vec<String>) {
        self.push(Role::Assistant, text, applied_paths);
    }

    pub fn record_system(&mut self, text: impl Into<String>) {
        self.push(Role::System, text, Vec::new());
    }

    pub fn record_error(&mut self, text: impl Into<String>) {
        self.push(Role::Error, text, Vec::new());
    }

    /// Up to `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ContextEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }

    pub fn applied_files(&self) -> &BTreeSet<String> {
        &self.applied_files
    }

    /// A turn is an edit once anything has been applied.
    pub fn is_edit(&self) -> bool {
        !self.applied_files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}
