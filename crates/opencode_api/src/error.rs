use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Error as JsonError;

use crate::events::NamedError;
use crate::retry::is_retryable_http_error;

#[derive(Debug)]
pub enum OpenCodeApiError {
    InvalidBaseUrl(String),
    InvalidHeader(String),
    Request(reqwest::Error),
    /// The HTTP client gave up waiting, whether while connecting or reading.
    Timeout(String),
    Status(StatusCode, String),
    Serde(JsonError),
    MissingSessionId,
    StreamClosed,
    ReadTimeout(Duration),
    Cancelled,
    Unknown(String),
}

impl OpenCodeApiError {
    /// Returns true when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(error) => {
                error.is_timeout() || error.is_connect() || error.is_body() || error.is_request()
            }
            Self::Status(status, message) => is_retryable_http_error(status.as_u16(), message),
            Self::Timeout(_) | Self::StreamClosed | Self::ReadTimeout(_) => true,
            Self::InvalidBaseUrl(_)
            | Self::InvalidHeader(_)
            | Self::Serde(_)
            | Self::MissingSessionId
            | Self::Cancelled
            | Self::Unknown(_) => false,
        }
    }

    /// Returns true when the server actively refused or could not route the
    /// connection. A connect attempt that merely timed out is not included.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Request(error) if error.is_connect() && !error.is_timeout())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ReadTimeout(_))
    }
}

/// Error body shapes returned by the opencode server.
///
/// The server reports named errors as `{"name": .., "data": {"message": ..}}`;
/// proxies in front of it tend to use `{"error": {"message": ..}}` or a bare
/// `{"message": ..}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayload {
    #[serde(flatten)]
    named: NamedError,
    message: Option<String>,
    error: Option<ErrorPayloadField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorPayloadField {
    Text(String),
    Object { message: Option<String> },
}

impl ErrorPayload {
    fn message_or_fallback(&self) -> Option<String> {
        self.named
            .data_message()
            .or_else(|| self.message.as_deref().and_then(non_empty_string))
            .or_else(|| match &self.error {
                Some(ErrorPayloadField::Text(text)) => non_empty_string(text),
                Some(ErrorPayloadField::Object { message }) => {
                    message.as_deref().and_then(non_empty_string)
                }
                None => None,
            })
            .or_else(|| self.named.name.as_deref().and_then(non_empty_string))
            .map(str::to_owned)
    }
}

impl fmt::Display for OpenCodeApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Timeout(message) => write!(f, "request timed out: {message}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::MissingSessionId => write!(f, "server response did not include a session id"),
            Self::StreamClosed => write!(f, "event stream closed by server"),
            Self::ReadTimeout(timeout) => {
                write!(f, "no data received within {}s", timeout.as_secs())
            }
            Self::Cancelled => write!(f, "request was cancelled"),
            Self::Unknown(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for OpenCodeApiError {}

impl From<reqwest::Error> for OpenCodeApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::Request(error)
        }
    }
}

impl From<JsonError> for OpenCodeApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) {
        if let Some(message) = payload.message_or_fallback() {
            return message;
        }
    }

    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.trim().to_string()
    }
}

fn non_empty_string(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
