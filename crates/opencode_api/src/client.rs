use std::collections::VecDeque;
use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;

use crate::config::OpenCodeApiConfig;
use crate::error::{parse_error_message, OpenCodeApiError};
use crate::events::{BusEvent, MessageWithParts, SessionInfo};
use crate::headers::{build_headers, ResponseKind};
use crate::payload::PromptRequest;
use crate::sse::SseStreamParser;
use crate::url::{
    config_url, event_url, normalize_base_url, session_abort_url, session_message_url, session_url,
};

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct OpenCodeApiClient {
    http: Client,
    config: OpenCodeApiConfig,
}

impl OpenCodeApiClient {
    pub fn new(config: OpenCodeApiConfig) -> Result<Self, OpenCodeApiError> {
        let base_url = normalize_base_url(&config.base_url);
        Url::parse(&base_url).map_err(|error| {
            OpenCodeApiError::InvalidBaseUrl(format!("{base_url}: {error}"))
        })?;

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(OpenCodeApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OpenCodeApiConfig {
        &self.config
    }

    pub fn build_headers(&self, kind: ResponseKind) -> Result<HeaderMap, OpenCodeApiError> {
        let headers = build_headers(&self.config, kind);
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                    OpenCodeApiError::InvalidHeader(format!("invalid header key: {key}"))
                })?,
                HeaderValue::from_str(&value).map_err(|_| {
                    OpenCodeApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    /// Checks the server is up by fetching its configuration.
    pub async fn health_check(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<(), OpenCodeApiError> {
        let request = self
            .http
            .get(config_url(&self.config.base_url))
            .headers(self.build_headers(ResponseKind::Json)?)
            .timeout(self.config.timeout);
        self.send_checked(request, cancellation).await?;
        Ok(())
    }

    /// Creates a new server-side session.
    pub async fn create_session(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<SessionInfo, OpenCodeApiError> {
        let request = self
            .http
            .post(session_url(&self.config.base_url))
            .headers(self.build_headers(ResponseKind::Json)?)
            .timeout(self.config.timeout)
            .body("{}");
        let session: SessionInfo = self.send_json(request, cancellation).await?;
        if session.id.trim().is_empty() {
            return Err(OpenCodeApiError::MissingSessionId);
        }
        tracing::debug!(session_id = %session.id, "created opencode session");
        Ok(session)
    }

    /// Submits a prompt and waits until the server has finished answering it.
    ///
    /// The answer itself is observed on the event stream; the returned message
    /// is the server's final view of the assistant reply.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &PromptRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<MessageWithParts, OpenCodeApiError> {
        let request = self
            .http
            .post(session_message_url(&self.config.base_url, session_id))
            .headers(self.build_headers(ResponseKind::Json)?)
            .json(prompt);
        tracing::debug!(session_id, model = %prompt.model.model_id, "submitting prompt");
        self.send_json(request, cancellation).await
    }

    /// Lists a session's messages, oldest first.
    pub async fn list_messages(
        &self,
        session_id: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Vec<MessageWithParts>, OpenCodeApiError> {
        let request = self
            .http
            .get(session_message_url(&self.config.base_url, session_id))
            .headers(self.build_headers(ResponseKind::Json)?)
            .timeout(self.config.timeout);
        self.send_json(request, cancellation).await
    }

    /// Stops whatever the server is generating for `session_id`.
    pub async fn abort(
        &self,
        session_id: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<(), OpenCodeApiError> {
        let request = self
            .http
            .post(session_abort_url(&self.config.base_url, session_id))
            .headers(self.build_headers(ResponseKind::Json)?)
            .timeout(self.config.timeout)
            .body("{}");
        self.send_checked(request, cancellation).await?;
        tracing::debug!(session_id, "aborted opencode session");
        Ok(())
    }

    /// Opens the server's event stream.
    pub async fn subscribe_events(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<EventSubscription, OpenCodeApiError> {
        let request = self
            .http
            .get(event_url(&self.config.base_url))
            .headers(self.build_headers(ResponseKind::EventStream)?);
        let response = self.send_checked(request, cancellation).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(EventSubscription {
            stream,
            parser: SseStreamParser::default(),
            pending: VecDeque::new(),
            read_timeout: self.config.timeout,
        })
    }

    async fn send_checked(
        &self,
        request: RequestBuilder,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, OpenCodeApiError> {
        let response = await_or_cancel(request.send(), cancellation)
            .await?
            .map_err(OpenCodeApiError::from)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = await_or_cancel(response.text(), cancellation)
            .await?
            .unwrap_or_default();
        Err(OpenCodeApiError::Status(
            status,
            parse_error_message(status, &body),
        ))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<T, OpenCodeApiError> {
        let response = self.send_checked(request, cancellation).await?;
        let body = await_or_cancel(response.text(), cancellation)
            .await?
            .map_err(OpenCodeApiError::from)?;
        serde_json::from_str(&body).map_err(OpenCodeApiError::from)
    }
}

/// Open `/event` stream yielding decoded bus events.
pub struct EventSubscription {
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: SseStreamParser,
    pending: VecDeque<BusEvent>,
    read_timeout: Duration,
}

impl EventSubscription {
    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` once the server closes the stream. A read that
    /// produces no bytes within the configured timeout fails with
    /// [`OpenCodeApiError::ReadTimeout`].
    pub async fn next_event(
        &mut self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Option<BusEvent>, OpenCodeApiError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let read = tokio::time::timeout(self.read_timeout, self.stream.next());
            let chunk = match await_or_cancel(read, cancellation).await? {
                Ok(Some(chunk)) => chunk.map_err(OpenCodeApiError::from)?,
                Ok(None) => return Ok(None),
                Err(_) => return Err(OpenCodeApiError::ReadTimeout(self.read_timeout)),
            };
            self.pending.extend(self.parser.feed(&chunk));
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("pending", &self.pending.len())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

/// Drives `future` while polling `cancellation` every few milliseconds.
pub async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, OpenCodeApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(OpenCodeApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(OpenCodeApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{await_or_cancel, CancellationSignal, OpenCodeApiClient};
    use crate::config::OpenCodeApiConfig;
    use crate::error::OpenCodeApiError;
    use crate::headers::ResponseKind;

    #[test]
    fn new_rejects_unparseable_base_url() {
        let error = OpenCodeApiClient::new(OpenCodeApiConfig::new("not a url"))
            .expect_err("base URL should be rejected");
        assert!(matches!(error, OpenCodeApiError::InvalidBaseUrl(_)));
    }

    #[test]
    fn event_stream_headers_request_sse() {
        let client = OpenCodeApiClient::new(OpenCodeApiConfig::default()).expect("client");
        let headers = client
            .build_headers(ResponseKind::EventStream)
            .expect("headers");
        assert_eq!(
            headers.get("accept").and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );
        assert!(headers.get("content-type").is_none());
    }

    #[tokio::test]
    async fn await_or_cancel_returns_cancelled_for_raised_signal() {
        let cancel: CancellationSignal = Arc::new(AtomicBool::new(false));
        let raiser = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            raiser.store(true, Ordering::Release);
        });

        let result = await_or_cancel(
            tokio::time::sleep(Duration::from_secs(30)),
            Some(&cancel),
        )
        .await;
        assert!(matches!(result, Err(OpenCodeApiError::Cancelled)));
    }

    #[tokio::test]
    async fn await_or_cancel_passes_through_without_signal() {
        let value = await_or_cancel(async { 7 }, None)
            .await
            .expect("uncancellable future should resolve");
        assert_eq!(value, 7);
    }
}
