//! Conversation model and the per-turn status machine.

mod snapshot;

use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::TurnError;

pub use snapshot::{ConversationSnapshot, SNAPSHOT_VERSION};

/// Opaque turn identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TurnId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TurnId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Errored,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Complete | TurnStatus::Errored | TurnStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an allowed edge of the turn lifecycle.
    ///
    /// `pending -> streaming -> {complete, errored, cancelled}`, and a pending
    /// turn may also end directly. Terminal states have no way out.
    pub fn can_transition_to(self, next: TurnStatus) -> bool {
        match self {
            TurnStatus::Pending => next != TurnStatus::Pending,
            TurnStatus::Streaming => next.is_terminal(),
            TurnStatus::Complete | TurnStatus::Errored | TurnStatus::Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Complete => "complete",
            TurnStatus::Errored => "errored",
            TurnStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation reported by the assistant during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub finished: bool,
}

impl ToolCallRecord {
    pub fn started(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            input,
            output: None,
            is_error: false,
            finished: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub raw_text: String,
    pub status: TurnStatus,
    /// RFC 3339 UTC creation time.
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TurnError>,
}

impl Turn {
    /// A user turn is complete the moment it exists.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into(), TurnStatus::Complete)
    }

    pub fn assistant() -> Self {
        Self::new(Role::Assistant, String::new(), TurnStatus::Pending)
    }

    fn new(role: Role, raw_text: String, status: TurnStatus) -> Self {
        Self {
            id: TurnId::new(),
            role,
            raw_text,
            status,
            created_at: now_rfc3339(),
            tool_calls: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls.iter().find(|call| call.call_id == call_id)
    }

    pub fn tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCallRecord> {
        self.tool_calls
            .iter_mut()
            .find(|call| call.call_id == call_id)
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to format turn timestamp");
            String::new()
        })
}

/// A status change that the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TurnStatus,
    pub to: TurnStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn cannot move from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Ordered list of turns; insertion order is display order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn get(&self, id: &TurnId) -> Option<&Turn> {
        self.turns.iter().find(|turn| &turn.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &TurnId) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|turn| &turn.id == id)
    }

    /// The turn that is still pending or streaming, if any.
    pub fn active_turn(&self) -> Option<&Turn> {
        self.turns.iter().find(|turn| !turn.is_terminal())
    }

    pub(crate) fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    pub(crate) fn clear(&mut self) {
        self.turns.clear();
    }

    /// Moves turn `id` to `next`, returning the previous status.
    ///
    /// Unknown turns and disallowed edges leave the conversation untouched.
    pub(crate) fn transition(
        &mut self,
        id: &TurnId,
        next: TurnStatus,
    ) -> Option<Result<TurnStatus, InvalidTransition>> {
        let turn = self.get_mut(id)?;
        let from = turn.status;
        if !from.can_transition_to(next) {
            return Some(Err(InvalidTransition { from, to: next }));
        }
        turn.status = next;
        Some(Ok(from))
    }
}
