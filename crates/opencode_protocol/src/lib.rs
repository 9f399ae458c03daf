//! Transport-neutral contract between the opencode session core and the
//! services that stream assistant output to it.
//!
//! This crate defines only the stream event vocabulary, the per-turn request
//! envelope, and the blocking transport seam. Wire formats, HTTP details and
//! conversation bookkeeping live in the crates on either side of it.

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared cancellation flag for one turn.
pub type CancelSignal = Arc<AtomicBool>;

/// Returns true once `cancel` has been raised.
#[must_use]
pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    cancel.load(Ordering::Acquire)
}

/// One unit of streamed output for a turn, consumed exactly once in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolCallEnd {
        call_id: String,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    Done,
}

impl StreamEvent {
    /// Convenience constructor for text deltas.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    /// Convenience constructor for service-reported errors without a code.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            code: None,
            message: message.into(),
        }
    }

    /// Returns true when this event ends the turn's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }
}

/// Speaker of one prior conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
}

/// Completed message carried as context for a new turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub text: String,
}

/// Input required to stream one assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// Opaque identifier of the assistant turn being produced.
    pub turn_id: String,
    /// User text that opened the turn.
    pub prompt: String,
    /// Completed messages preceding `prompt`, oldest first.
    pub history: Vec<HistoryMessage>,
    /// Optional system instructions forwarded to services that accept them.
    pub instructions: Option<String>,
}

/// Where a (re)connecting transport should pick a turn back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePoint {
    /// Zero for the first connection of a turn, incremented per reconnect.
    pub attempt: u32,
    /// Bytes of assistant text already delivered for this turn.
    pub received_text_len: usize,
    /// True once an earlier connection got the request accepted by the service.
    pub request_accepted: bool,
}

impl ResumePoint {
    /// Resume point of a turn that has not connected yet.
    #[must_use]
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Returns true when nothing has been sent or received for the turn.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.attempt == 0 && !self.request_accepted && self.received_text_len == 0
    }
}

/// Broad classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailureKind {
    /// Recoverable by reconnecting (dropped connection, timeout, retryable status).
    Transient,
    /// The service cannot be reached or refused the request permanently.
    Fatal,
    /// The service sent something that violates the stream contract.
    Protocol,
    /// The turn's cancel signal was raised while waiting.
    Cancelled,
}

/// Error returned by transports while opening or reading a turn stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    kind: TransportFailureKind,
    message: String,
}

impl TransportFailure {
    #[must_use]
    pub fn new(kind: TransportFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TransportFailureKind::Transient, message)
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(TransportFailureKind::Fatal, message)
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportFailureKind::Protocol, message)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(TransportFailureKind::Cancelled, "turn was cancelled")
    }

    #[must_use]
    pub fn kind(&self) -> TransportFailureKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true when reconnecting may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == TransportFailureKind::Transient
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            TransportFailureKind::Transient => "transient transport failure",
            TransportFailureKind::Fatal => "transport failure",
            TransportFailureKind::Protocol => "protocol violation",
            TransportFailureKind::Cancelled => "cancelled",
        };
        write!(f, "{label}: {}", self.message)
    }
}

impl std::error::Error for TransportFailure {}

/// Ordered source of stream events for one connection of one turn.
pub trait EventStream: Send {
    /// Blocks until the next event arrives.
    ///
    /// Returns `Ok(None)` when the connection ended. Implementations must
    /// observe `cancel` at least every few tens of milliseconds and return
    /// [`TransportFailureKind::Cancelled`] once it is raised.
    fn next_event(&mut self, cancel: &CancelSignal) -> Result<Option<StreamEvent>, TransportFailure>;

    /// Returns true once the service accepted the turn's request on this connection.
    fn request_accepted(&self) -> bool {
        true
    }
}

/// Connection factory for assistant turns.
pub trait Transport: Send + Sync + 'static {
    /// Opens (or reopens, per `resume`) the event stream for `request`.
    fn open(
        &self,
        request: &TurnRequest,
        resume: &ResumePoint,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn EventStream>, TransportFailure>;

    /// Asks the service to stop producing output for `request`. Best effort.
    fn abort(&self, _request: &TurnRequest) {}

    /// Drops any service-side conversation state held by the transport.
    fn reset(&self) {}
}
