//! Streaming session core for editor-embedded opencode assistants.
//!
//! Invariant: the host only ever sees finalized blocks plus at most one open
//! tail block per turn; nothing it has been shown is retracted.
//!
//! # Public API Overview
//! - Drive a conversation through [`Session`]: submit input, cancel, reset,
//!   and export or import its state.
//! - Receive render patches, status changes, and errors via [`HostAdapter`].
//! - Render growing Markdown text on its own with [`IncrementalRenderer`].
//! - Plug in any service through the [`opencode_protocol::Transport`] seam.

pub mod config;
pub mod conversation;
pub mod error;
pub mod host;
pub mod logging;
pub mod markdown;
pub mod session;

/// Session configuration and reconnection policy.
pub use crate::config::{RetryPolicy, SessionConfig};
/// Conversation model and snapshots.
pub use crate::conversation::{
    Conversation, ConversationSnapshot, Role, ToolCallRecord, Turn, TurnId, TurnStatus,
    SNAPSHOT_VERSION,
};
/// Error taxonomy.
pub use crate::error::{ErrorKind, SessionError, TurnError};
/// Host-facing notification interface.
pub use crate::host::{HostAdapter, HostEvent, RecordingHost};
/// Incremental Markdown rendering.
pub use crate::markdown::{
    apply_patches, render_document, BlockKind, ColumnAlign, IncrementalRenderer, RenderPatch,
    RenderedBlock, TableShape,
};
/// Streaming session and per-turn handle.
pub use crate::session::{Session, SessionHandle};

/// Transport contract shared with transport implementations.
pub use opencode_protocol;
