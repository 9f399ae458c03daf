use std::sync::atomic::Ordering;

use opencode_protocol::{CancelSignal, HistoryMessage, HistoryRole, StreamEvent};

use crate::conversation::{Conversation, Role, ToolCallRecord, Turn, TurnId, TurnStatus};
use crate::error::{ErrorKind, TurnError};
use crate::host::HostEvent;
use crate::markdown::{IncrementalRenderer, RenderPatch};

use super::outbox::Outbox;

/// Whether the worker should keep reading events for its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Stop,
}

/// Bookkeeping for the turn that currently owns a worker.
pub(super) struct ActiveTurn {
    pub(super) turn_id: TurnId,
    pub(super) cancel: CancelSignal,
    renderer: IncrementalRenderer,
}

impl ActiveTurn {
    pub(super) fn new(turn_id: TurnId, cancel: CancelSignal) -> Self {
        Self {
            turn_id,
            cancel,
            renderer: IncrementalRenderer::new(),
        }
    }
}

#[derive(Default)]
pub(super) struct SessionState {
    pub(super) conversation: Conversation,
    pub(super) active: Option<ActiveTurn>,
}

impl SessionState {
    /// Completed turns that precede a new prompt, as transport history.
    pub(super) fn history(&self) -> Vec<HistoryMessage> {
        self.conversation
            .turns()
            .iter()
            .filter(|turn| turn.status == TurnStatus::Complete && !turn.raw_text.is_empty())
            .map(|turn| HistoryMessage {
                role: match turn.role {
                    Role::User => HistoryRole::User,
                    Role::Assistant => HistoryRole::Assistant,
                },
                text: turn.raw_text.clone(),
            })
            .collect()
    }

    fn active_mut(&mut self, turn_id: &TurnId) -> Option<&mut ActiveTurn> {
        self.active
            .as_mut()
            .filter(|active| &active.turn_id == turn_id)
    }

    fn is_live(&self, turn_id: &TurnId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| &active.turn_id == turn_id)
            && self
                .conversation
                .get(turn_id)
                .is_some_and(|turn| !turn.is_terminal())
    }

    /// Applies one stream event to `turn_id`, queueing the notifications it
    /// causes.
    pub(super) fn apply_event(
        &mut self,
        turn_id: &TurnId,
        event: StreamEvent,
        outbox: &Outbox,
    ) -> Flow {
        if !self.is_live(turn_id) {
            tracing::debug!(%turn_id, "dropping stream event for finished turn");
            return Flow::Stop;
        }

        match event {
            StreamEvent::TextDelta { text } => {
                if text.is_empty() {
                    return Flow::Continue;
                }
                self.begin_streaming(turn_id, outbox);
                if let Some(turn) = self.conversation.get_mut(turn_id) {
                    turn.raw_text.push_str(&text);
                }
                let patches = self
                    .active_mut(turn_id)
                    .map(|active| active.renderer.feed(&text))
                    .unwrap_or_default();
                push_patches(turn_id, patches, outbox);
                Flow::Continue
            }
            StreamEvent::ToolCallStart {
                call_id,
                tool_name,
                input,
            } => {
                let duplicate = self
                    .conversation
                    .get(turn_id)
                    .is_some_and(|turn| turn.tool_call(&call_id).is_some());
                if duplicate {
                    self.fail(
                        turn_id,
                        TurnError::new(
                            ErrorKind::ProtocolViolation,
                            format!("tool call {call_id} started twice"),
                        ),
                        outbox,
                    );
                    return Flow::Stop;
                }

                self.begin_streaming(turn_id, outbox);
                let record = ToolCallRecord::started(call_id, tool_name, input);
                tracing::debug!(%turn_id, call_id = %record.call_id, tool = %record.tool_name, "tool call started");
                if let Some(turn) = self.conversation.get_mut(turn_id) {
                    turn.tool_calls.push(record.clone());
                }
                outbox.push(HostEvent::ToolCall(turn_id.clone(), record));
                Flow::Continue
            }
            StreamEvent::ToolCallEnd {
                call_id,
                output,
                is_error,
            } => {
                let updated = self
                    .conversation
                    .get_mut(turn_id)
                    .and_then(|turn| turn.tool_call_mut(&call_id))
                    .filter(|record| !record.finished)
                    .map(|record| {
                        record.output = output;
                        record.is_error = is_error;
                        record.finished = true;
                        record.clone()
                    });
                match updated {
                    Some(record) => {
                        outbox.push(HostEvent::ToolCall(turn_id.clone(), record));
                        Flow::Continue
                    }
                    None => {
                        self.fail(
                            turn_id,
                            TurnError::new(
                                ErrorKind::ProtocolViolation,
                                format!("tool call {call_id} ended without being open"),
                            ),
                            outbox,
                        );
                        Flow::Stop
                    }
                }
            }
            StreamEvent::Error { code, message } => {
                self.fail(
                    turn_id,
                    TurnError::new(ErrorKind::ServiceError, message).with_code(code),
                    outbox,
                );
                Flow::Stop
            }
            StreamEvent::Done => {
                self.finalize_renderer(turn_id, outbox);
                self.set_status(turn_id, TurnStatus::Complete, outbox);
                tracing::info!(%turn_id, "turn complete");
                Flow::Stop
            }
        }
    }

    /// Ends `turn_id` with `error`, keeping whatever text already arrived.
    pub(super) fn fail(&mut self, turn_id: &TurnId, error: TurnError, outbox: &Outbox) {
        if !self.is_live(turn_id) {
            return;
        }
        tracing::warn!(%turn_id, kind = %error.kind, message = %error.message, "turn failed");
        self.finalize_renderer(turn_id, outbox);
        if let Some(turn) = self.conversation.get_mut(turn_id) {
            turn.error = Some(error.clone());
        }
        self.set_status(turn_id, TurnStatus::Errored, outbox);
        outbox.push(HostEvent::Error(turn_id.clone(), error));
    }

    /// Cancels `turn_id` if it is still in flight. Returns false when there
    /// was nothing to cancel.
    pub(super) fn cancel(&mut self, turn_id: &TurnId, outbox: &Outbox) -> bool {
        if !self.is_live(turn_id) {
            return false;
        }
        if let Some(active) = self.active_mut(turn_id) {
            active.cancel.store(true, Ordering::Release);
        }
        self.finalize_renderer(turn_id, outbox);
        self.set_status(turn_id, TurnStatus::Cancelled, outbox);
        tracing::info!(%turn_id, "turn cancelled");
        true
    }

    /// Settles a turn whose worker is exiting and releases its slot.
    ///
    /// Returns the turn's final status.
    pub(super) fn finish_worker(&mut self, turn_id: &TurnId, outbox: &Outbox) -> TurnStatus {
        if self.is_live(turn_id) {
            let cancelled = self
                .active
                .as_ref()
                .is_some_and(|active| opencode_protocol::is_cancelled(&active.cancel));
            if cancelled {
                self.cancel(turn_id, outbox);
            } else {
                self.fail(
                    turn_id,
                    TurnError::new(
                        ErrorKind::TransportError,
                        "turn worker exited without a terminal event",
                    ),
                    outbox,
                );
            }
        }

        if self
            .active
            .as_ref()
            .is_some_and(|active| &active.turn_id == turn_id)
        {
            self.active = None;
        }

        self.conversation
            .get(turn_id)
            .map_or(TurnStatus::Cancelled, |turn| turn.status)
    }

    fn begin_streaming(&mut self, turn_id: &TurnId, outbox: &Outbox) {
        let pending = self
            .conversation
            .get(turn_id)
            .is_some_and(|turn| turn.status == TurnStatus::Pending);
        if pending {
            self.set_status(turn_id, TurnStatus::Streaming, outbox);
        }
    }

    fn finalize_renderer(&mut self, turn_id: &TurnId, outbox: &Outbox) {
        let patches = self
            .active_mut(turn_id)
            .map(|active| active.renderer.finalize())
            .unwrap_or_default();
        push_patches(turn_id, patches, outbox);
    }

    fn set_status(&mut self, turn_id: &TurnId, next: TurnStatus, outbox: &Outbox) {
        match self.conversation.transition(turn_id, next) {
            Some(Ok(_)) => outbox.push(HostEvent::Status(turn_id.clone(), next)),
            Some(Err(invalid)) => {
                tracing::warn!(%turn_id, %invalid, "ignoring disallowed turn transition");
                outbox.push(HostEvent::Diagnostic(turn_id.clone(), invalid.to_string()));
            }
            None => tracing::warn!(%turn_id, status = %next, "status change for unknown turn"),
        }
    }
}

fn push_patches(turn_id: &TurnId, patches: Vec<RenderPatch>, outbox: &Outbox) {
    for patch in patches {
        outbox.push(HostEvent::Patch(turn_id.clone(), patch));
    }
}

/// Adds a user turn and a pending assistant turn, returning their ids.
pub(super) fn open_turn_pair(conversation: &mut Conversation, user_text: &str) -> (TurnId, TurnId) {
    let user = Turn::user(user_text);
    let assistant = Turn::assistant();
    let ids = (user.id.clone(), assistant.id.clone());
    conversation.push(user);
    conversation.push(assistant);
    ids
}
