use opencode_api::retry::*;

#[test]
fn retry_http_status_is_retryable() {
    assert!(is_retryable_http_error(408, ""));
    assert!(is_retryable_http_error(429, ""));
    assert!(is_retryable_http_error(500, ""));
    assert!(is_retryable_http_error(502, ""));
    assert!(is_retryable_http_error(503, ""));
    assert!(is_retryable_http_error(504, ""));
}

#[test]
fn retry_http_error_pattern_is_retryable() {
    assert!(is_retryable_http_error(400, "rate limit exceeded"));
    assert!(is_retryable_http_error(400, "connection refused"));
    assert!(is_retryable_http_error(400, "Provider is overloaded"));
}

#[test]
fn client_errors_are_not_retryable() {
    assert!(!is_retryable_http_error(400, "invalid model"));
    assert!(!is_retryable_http_error(404, "session not found"));
}
