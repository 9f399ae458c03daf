use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::TurnId;

/// Synchronous failures of [`Session`](crate::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("turn {active} is still in flight; cancel it or wait for it to finish")]
    ConcurrentTurn { active: TurnId },

    #[error("input is empty")]
    EmptyInput,

    #[error("unsupported conversation snapshot version {found}; expected {expected}")]
    UnsupportedSnapshot { found: u32, expected: u32 },

    #[error("failed to spawn turn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SessionError::ConcurrentTurn { .. } => Some(ErrorKind::ConcurrentTurnError),
            _ => None,
        }
    }
}

/// Why a turn ended in the `errored` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The connection could not be established or failed in a way that is
    /// not worth retrying.
    TransportError,
    /// Transient failures kept recurring until the retry budget ran out.
    TransportExhausted,
    /// The assistant service reported an error in-band.
    ServiceError,
    ConcurrentTurnError,
    /// The event stream broke its own rules, e.g. ended a tool call that
    /// never started.
    ProtocolViolation,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransportError => "transport_error",
            ErrorKind::TransportExhausted => "transport_exhausted",
            ErrorKind::ServiceError => "service_error",
            ErrorKind::ConcurrentTurnError => "concurrent_turn_error",
            ErrorKind::ProtocolViolation => "protocol_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a turn and reported once to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: ErrorKind,
    pub message: String,
    /// Service-provided error code, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl TurnError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TurnError {}
