//! Interface between the session core and whatever displays it.

use std::sync::{Mutex, MutexGuard};

use crate::conversation::{ToolCallRecord, TurnId, TurnStatus};
use crate::error::TurnError;
use crate::markdown::{apply_patches, RenderPatch, RenderedBlock};

/// Receives every notification a [`Session`](crate::Session) produces.
///
/// Calls arrive in order, one at a time, and never while the session holds
/// its internal lock, so implementations may call back into the session
/// (for example to cancel from a status callback).
pub trait HostAdapter: Send + Sync {
    fn on_render_patch(&self, turn_id: &TurnId, patch: &RenderPatch);

    fn on_status_change(&self, turn_id: &TurnId, status: TurnStatus);

    fn on_error(&self, turn_id: &TurnId, error: &TurnError);

    fn on_tool_call(&self, _turn_id: &TurnId, _record: &ToolCallRecord) {}

    /// Reports a session misuse or an internal inconsistency that was
    /// ignored, such as a disallowed status transition.
    fn on_diagnostic(&self, _turn_id: &TurnId, _message: &str) {}
}

/// One notification as seen by a [`RecordingHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Patch(TurnId, RenderPatch),
    Status(TurnId, TurnStatus),
    Error(TurnId, TurnError),
    ToolCall(TurnId, ToolCallRecord),
    Diagnostic(TurnId, String),
}

impl HostEvent {
    pub fn turn_id(&self) -> &TurnId {
        match self {
            HostEvent::Patch(turn_id, _)
            | HostEvent::Status(turn_id, _)
            | HostEvent::Error(turn_id, _)
            | HostEvent::ToolCall(turn_id, _)
            | HostEvent::Diagnostic(turn_id, _) => turn_id,
        }
    }
}

/// Host that records notifications in arrival order.
#[derive(Debug, Default)]
pub struct RecordingHost {
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().clone()
    }

    pub fn patches(&self, turn_id: &TurnId) -> Vec<RenderPatch> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                HostEvent::Patch(id, patch) if id == turn_id => Some(patch.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, turn_id: &TurnId) -> Vec<TurnStatus> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                HostEvent::Status(id, status) if id == turn_id => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(TurnId, TurnError)> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                HostEvent::Error(id, error) => Some((id.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                HostEvent::Diagnostic(_, message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// The block list a host would hold for `turn_id` after applying every
    /// recorded patch.
    pub fn blocks(&self, turn_id: &TurnId) -> Vec<RenderedBlock> {
        let mut blocks = Vec::new();
        apply_patches(&mut blocks, &self.patches(turn_id));
        blocks
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, event: HostEvent) {
        self.lock().push(event);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HostEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostAdapter for RecordingHost {
    fn on_render_patch(&self, turn_id: &TurnId, patch: &RenderPatch) {
        self.push(HostEvent::Patch(turn_id.clone(), patch.clone()));
    }

    fn on_status_change(&self, turn_id: &TurnId, status: TurnStatus) {
        self.push(HostEvent::Status(turn_id.clone(), status));
    }

    fn on_error(&self, turn_id: &TurnId, error: &TurnError) {
        self.push(HostEvent::Error(turn_id.clone(), error.clone()));
    }

    fn on_tool_call(&self, turn_id: &TurnId, record: &ToolCallRecord) {
        self.push(HostEvent::ToolCall(turn_id.clone(), record.clone()));
    }

    fn on_diagnostic(&self, turn_id: &TurnId, message: &str) {
        self.push(HostEvent::Diagnostic(turn_id.clone(), message.to_string()));
    }
}
