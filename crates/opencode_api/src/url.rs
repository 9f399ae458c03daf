/// Default base URL of a locally running `opencode serve`.
pub const DEFAULT_OPENCODE_BASE_URL: &str = "http://localhost:1993";

/// Normalize a configured base URL.
///
/// Normalization rules:
/// 1) blank input falls back to [`DEFAULT_OPENCODE_BASE_URL`]
/// 2) surrounding whitespace and trailing slashes are removed
pub fn normalize_base_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_OPENCODE_BASE_URL
    } else {
        input.trim()
    };

    base.trim_end_matches('/').to_string()
}

/// `POST` target creating a server-side session.
pub fn session_url(base_url: &str) -> String {
    format!("{}/session", normalize_base_url(base_url))
}

/// `POST` (prompt) and `GET` (history) target for one session's messages.
pub fn session_message_url(base_url: &str, session_id: &str) -> String {
    format!(
        "{}/session/{}/message",
        normalize_base_url(base_url),
        session_id.trim()
    )
}

/// `POST` target stopping the in-flight response of a session.
pub fn session_abort_url(base_url: &str, session_id: &str) -> String {
    format!(
        "{}/session/{}/abort",
        normalize_base_url(base_url),
        session_id.trim()
    )
}

/// Server-sent event stream shared by all sessions.
pub fn event_url(base_url: &str) -> String {
    format!("{}/event", normalize_base_url(base_url))
}

/// Lightweight endpoint used to check that the server is reachable.
pub fn config_url(base_url: &str) -> String {
    format!("{}/config", normalize_base_url(base_url))
}
