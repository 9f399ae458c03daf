use std::collections::BTreeMap;

use crate::config::OpenCodeApiConfig;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CACHE_CONTROL: &str = "cache-control";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_USER_AGENT: &str = "user-agent";

/// What a request expects back from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Json,
    EventStream,
}

/// Build a deterministic header map for opencode server requests.
pub fn build_headers(config: &OpenCodeApiConfig, kind: ResponseKind) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    match kind {
        ResponseKind::Json => {
            headers.insert(HEADER_ACCEPT.to_owned(), "application/json".to_owned());
            headers.insert(
                HEADER_CONTENT_TYPE.to_owned(),
                "application/json".to_owned(),
            );
        }
        ResponseKind::EventStream => {
            headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
            headers.insert(HEADER_CACHE_CONTROL.to_owned(), "no-cache".to_owned());
        }
    }

    let ua = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), ua);

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    headers
}

fn default_user_agent() -> String {
    format!(
        "opencode-session/{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        normalize_arch(std::env::consts::ARCH)
    )
}

fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" => "x64".to_owned(),
        "x86" | "i386" | "i686" => "ia32".to_owned(),
        "aarch64" => "arm64".to_owned(),
        normalized => normalized.to_owned(),
    }
}
