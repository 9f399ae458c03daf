//! Transport-only opencode server client primitives.
//!
//! This crate owns request building, response parsing and event stream
//! decoding for the opencode HTTP API only. It does not start or supervise
//! the server process and has no knowledge of conversation state.
//!
//! Server events arrive on a single `/event` SSE stream shared by every
//! session; [`SseStreamParser`] decodes frames into [`BusEvent`]s and callers
//! filter them by session id.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::{CancellationSignal, EventSubscription, OpenCodeApiClient};
pub use config::OpenCodeApiConfig;
pub use error::OpenCodeApiError;
pub use events::{BusEvent, MessageInfo, MessagePart, MessageWithParts, SessionInfo, ToolState};
pub use reqwest::StatusCode;
pub use payload::{ModelRef, PromptPart, PromptRequest};
pub use sse::SseStreamParser;
pub use url::normalize_base_url;
