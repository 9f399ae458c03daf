//! Translation of server bus events into per-turn stream events.

use std::collections::{HashMap, HashSet, VecDeque};

use opencode_api::events::NamedError;
use opencode_api::{BusEvent, MessagePart, MessageWithParts};
use opencode_protocol::StreamEvent;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
struct ToolProgress {
    started: bool,
    ended: bool,
}

/// Per-turn view of one server session's event traffic.
///
/// Text parts arrive as repeated snapshots of the whole part, so only the
/// unseen suffix of each part is forwarded.
#[derive(Debug)]
pub(crate) struct TurnEventMapper {
    session_id: String,
    queued: VecDeque<StreamEvent>,
    text_progress: HashMap<String, usize>,
    tools: HashMap<String, ToolProgress>,
    user_messages: HashSet<String>,
    finished: bool,
    request_accepted: bool,
}

impl TurnEventMapper {
    pub(crate) fn new(session_id: impl Into<String>, request_accepted: bool) -> Self {
        Self {
            session_id: session_id.into(),
            queued: VecDeque::new(),
            text_progress: HashMap::new(),
            tools: HashMap::new(),
            user_messages: HashSet::new(),
            finished: false,
            request_accepted,
        }
    }

    pub(crate) fn pop(&mut self) -> Option<StreamEvent> {
        self.queued.pop_front()
    }

    /// True once a terminal event was produced (it may still be queued).
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn request_accepted(&self) -> bool {
        self.request_accepted
    }

    pub(crate) fn handle_bus_event(&mut self, event: BusEvent) {
        if self.finished {
            return;
        }

        match event.session_id() {
            Some(session_id) if session_id == self.session_id => {}
            // Session errors raised before a session exists carry no id.
            None if matches!(event, BusEvent::SessionError { .. }) => {}
            _ => return,
        }

        match event {
            BusEvent::MessageUpdated { info } => {
                self.request_accepted = true;
                if !info.is_assistant() {
                    self.user_messages.insert(info.id);
                    return;
                }
                if let Some(error) = info.error {
                    self.push_error(&error);
                }
            }
            BusEvent::MessagePartUpdated { part, delta } => {
                self.request_accepted = true;
                if self.user_messages.contains(&part.message_id) {
                    return;
                }
                self.apply_part(&part, delta.as_deref());
            }
            BusEvent::SessionIdle { .. } => self.push_terminal(StreamEvent::Done),
            BusEvent::SessionError { error, .. } => {
                self.push_error(&error.unwrap_or_default());
            }
            BusEvent::ServerConnected | BusEvent::Unknown { .. } => {}
        }
    }

    /// Applies the server's final reply returned by the prompt request.
    pub(crate) fn handle_prompt_reply(&mut self, reply: &MessageWithParts) {
        if self.finished {
            return;
        }
        self.request_accepted = true;

        if let Some(error) = &reply.info.error {
            self.push_error(error);
            return;
        }
        for part in &reply.parts {
            self.apply_part(part, None);
        }
        self.push_terminal(StreamEvent::Done);
    }

    /// Seeds progress from the session's stored messages after a reconnect and
    /// forwards whatever text the turn missed while disconnected.
    ///
    /// Tool calls that happened while disconnected are marked as seen without
    /// being forwarded.
    pub(crate) fn catch_up(&mut self, history: &[MessageWithParts], received_text_len: usize) {
        for message in history.iter().filter(|message| !message.info.is_assistant()) {
            self.user_messages.insert(message.info.id.clone());
        }

        let replies_start = history
            .iter()
            .rposition(|message| !message.info.is_assistant())
            .map_or(0, |index| index + 1);
        let replies = &history[replies_start..];

        let mut combined = String::new();
        for part in replies.iter().flat_map(|message| message.parts.iter()) {
            if part.is_text() {
                let text = part.text.as_deref().unwrap_or_default();
                combined.push_str(text);
                self.text_progress.insert(part.id.clone(), text.len());
            } else if part.is_tool() {
                let finished = part.state.as_ref().is_some_and(|state| state.is_finished());
                self.tools.insert(
                    tool_call_id(part),
                    ToolProgress {
                        started: true,
                        ended: finished,
                    },
                );
            }
        }

        match combined.get(received_text_len..) {
            Some(missed) if !missed.is_empty() => self.push(StreamEvent::text(missed)),
            Some(_) => {}
            None => tracing::warn!(
                received_text_len,
                stored_len = combined.len(),
                "stored reply does not extend the text already received"
            ),
        }

        if let Some(last) = replies.last() {
            if let Some(error) = &last.info.error {
                self.push_error(error);
            } else if last.info.is_final_reply() {
                self.push_terminal(StreamEvent::Done);
            }
        }
    }

    fn apply_part(&mut self, part: &MessagePart, delta: Option<&str>) {
        if part.is_text() {
            match (part.text.as_deref(), delta) {
                (Some(text), _) => self.apply_text_snapshot(&part.id, text),
                (None, Some(delta)) => self.apply_text_delta(&part.id, delta),
                (None, None) => {}
            }
        } else if part.is_tool() {
            self.apply_tool_part(part);
        }
    }

    fn apply_text_snapshot(&mut self, part_id: &str, text: &str) {
        let delivered = self.text_progress.get(part_id).copied().unwrap_or(0);
        if text.len() <= delivered {
            return;
        }
        match text.get(delivered..) {
            Some(suffix) => {
                self.push(StreamEvent::text(suffix));
                self.text_progress.insert(part_id.to_string(), text.len());
            }
            None => tracing::debug!(part_id, delivered, "text snapshot diverged from delivered text"),
        }
    }

    fn apply_text_delta(&mut self, part_id: &str, delta: &str) {
        if delta.is_empty() {
            return;
        }
        *self.text_progress.entry(part_id.to_string()).or_default() += delta.len();
        self.push(StreamEvent::text(delta));
    }

    fn apply_tool_part(&mut self, part: &MessagePart) {
        let Some(state) = &part.state else {
            return;
        };
        let call_id = tool_call_id(part);
        let progress = self.tools.entry(call_id.clone()).or_default();
        let mut events = Vec::new();

        if !progress.started {
            progress.started = true;
            events.push(StreamEvent::ToolCallStart {
                call_id: call_id.clone(),
                tool_name: part.tool.clone().unwrap_or_else(|| "tool".to_string()),
                input: state.input.clone().unwrap_or(Value::Null),
            });
        }
        if state.is_finished() && !progress.ended {
            progress.ended = true;
            events.push(StreamEvent::ToolCallEnd {
                call_id,
                output: state.output.clone().or_else(|| state.error.clone()),
                is_error: state.is_error(),
            });
        }

        self.queued.extend(events);
    }

    fn push_error(&mut self, error: &NamedError) {
        self.push_terminal(StreamEvent::Error {
            code: error.name.clone(),
            message: error.describe(),
        });
    }

    pub(crate) fn push_terminal(&mut self, event: StreamEvent) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.queued.push_back(event);
    }

    fn push(&mut self, event: StreamEvent) {
        self.queued.push_back(event);
    }
}

fn tool_call_id(part: &MessagePart) -> String {
    part.call_id.clone().unwrap_or_else(|| part.id.clone())
}
