use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::events::{BusEvent, NamedError};

/// Incremental parser for the server's SSE event stream.
///
/// Bytes are buffered until a blank line completes a frame, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<BusEvent> {
        self.buffer
            .extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));
        let mut events = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let frame = String::from_utf8_lossy(&self.buffer[..split]).into_owned();
            self.buffer.drain(0..split + 2);

            let Some((event_name, payload)) = extract_frame(&frame) else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => {
                    if let Some(event) = map_event(value, event_name.as_deref()) {
                        events.push(event);
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "ignoring malformed SSE payload");
                }
            }
        }

        events
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<BusEvent> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes())
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn extract_frame(frame: &str) -> Option<(Option<String>, String)> {
    let mut event_name = None;
    let mut data_lines = Vec::new();

    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event_name = Some(value.trim().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some((event_name, data_lines.join("\n").trim().to_string()))
    }
}

fn map_event(value: Value, event_name: Option<&str>) -> Option<BusEvent> {
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .or(event_name)?
        .to_string();
    let properties = value.get("properties").cloned().unwrap_or(Value::Null);

    let mapped = match event_type.as_str() {
        "server.connected" => Some(BusEvent::ServerConnected),
        "message.updated" => {
            property(&properties, "info").map(|info| BusEvent::MessageUpdated { info })
        }
        "message.part.updated" => property(&properties, "part").map(|part| {
            BusEvent::MessagePartUpdated {
                part,
                delta: properties
                    .get("delta")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            }
        }),
        "session.idle" => property::<String>(&properties, "sessionID")
            .map(|session_id| BusEvent::SessionIdle { session_id }),
        "session.error" => Some(BusEvent::SessionError {
            session_id: property(&properties, "sessionID"),
            error: property::<NamedError>(&properties, "error"),
        }),
        _ => None,
    };

    // Known types with an unexpected shape are kept as unknown rather than dropped.
    Some(mapped.unwrap_or(BusEvent::Unknown {
        event_type,
        payload: value,
    }))
}

fn property<T: DeserializeOwned>(properties: &Value, key: &str) -> Option<T> {
    let value = properties.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            tracing::debug!(%error, key, "ignoring malformed event property");
            None
        }
    }
}
