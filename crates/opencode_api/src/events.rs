use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-side conversation container returned by `POST /session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Epoch-millisecond timestamps attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: Option<f64>,
    #[serde(default)]
    pub completed: Option<f64>,
}

/// Error object in the server's `{ name, data: { message } }` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedError {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<NamedErrorData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedErrorData {
    #[serde(default)]
    pub message: Option<String>,
}

impl NamedError {
    pub(crate) fn data_message(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.message.as_deref())
            .filter(|message| !message.trim().is_empty())
    }

    /// Human-readable description, preferring the detailed message over the name.
    pub fn describe(&self) -> String {
        self.data_message()
            .or(self.name.as_deref())
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("unknown server error")
            .to_string()
    }
}

/// Metadata of one message (`message.updated` payload and history entries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: String,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(rename = "modelID", default)]
    pub model_id: Option<String>,
    #[serde(rename = "providerID", default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    /// Why generation stopped, e.g. `stop` or `tool-calls`.
    #[serde(default)]
    pub finish: Option<String>,
    #[serde(default)]
    pub error: Option<NamedError>,
}

impl MessageInfo {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    pub fn is_completed(&self) -> bool {
        self.time.completed.is_some()
    }

    /// True when the message completed and the server will not follow it
    /// with another assistant step.
    pub fn is_final_reply(&self) -> bool {
        self.is_assistant()
            && self.is_completed()
            && self.finish.as_deref() != Some("tool-calls")
    }
}

/// Execution state of a tool part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub status: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl ToolState {
    pub fn is_finished(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "error")
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// One part of a message: text, tool invocation, or a kind this client ignores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(rename = "callID", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub state: Option<ToolState>,
}

impl MessagePart {
    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    pub fn is_tool(&self) -> bool {
        self.kind == "tool"
    }
}

/// History entry returned by `GET /session/{id}/message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessageWithParts {
    /// Concatenated text of all text parts, in part order.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter(|part| part.is_text())
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

/// Event decoded from the server's `/event` stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    ServerConnected,
    MessageUpdated {
        info: MessageInfo,
    },
    MessagePartUpdated {
        part: MessagePart,
        delta: Option<String>,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: Option<String>,
        error: Option<NamedError>,
    },
    /// Event type this client does not interpret, kept for diagnostics.
    Unknown {
        event_type: String,
        payload: Value,
    },
}

impl BusEvent {
    /// Session the event belongs to, when it is session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::MessageUpdated { info } => Some(&info.session_id),
            Self::MessagePartUpdated { part, .. } => Some(&part.session_id),
            Self::SessionIdle { session_id } => Some(session_id),
            Self::SessionError { session_id, .. } => session_id.as_deref(),
            Self::ServerConnected | Self::Unknown { .. } => None,
        }
    }
}
