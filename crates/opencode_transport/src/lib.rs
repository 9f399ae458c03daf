//! opencode server implementation of the `opencode_protocol` transport contract.
//!
//! Each turn opens the server's shared `/event` stream, submits the prompt to
//! the conversation's server-side session, and translates that session's bus
//! events into ordered `StreamEvent`s. Reconnects resume from the session's
//! stored messages instead of resubmitting an accepted prompt.

mod stream;

use std::sync::{Arc, Mutex, MutexGuard};

use opencode_api::{
    BusEvent, MessageWithParts, OpenCodeApiClient, OpenCodeApiConfig, OpenCodeApiError,
    PromptRequest,
};
use opencode_protocol::{
    CancelSignal, EventStream, ResumePoint, StreamEvent, Transport, TransportFailure, TurnRequest,
};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::stream::TurnEventMapper;

/// Item produced by one open server connection.
enum ConnectionItem {
    Bus(BusEvent),
    PromptFinished(Result<MessageWithParts, OpenCodeApiError>),
}

trait ServerConnection: Send {
    fn next(&mut self, cancel: &CancelSignal) -> Result<Option<ConnectionItem>, OpenCodeApiError>;
}

/// Blocking view of the server operations a turn needs.
trait ServerApi: Send + Sync {
    fn create_session(&self, cancel: &CancelSignal) -> Result<String, OpenCodeApiError>;

    /// Subscribes to events, then submits `prompt` (when given) concurrently.
    fn connect(
        &self,
        session_id: &str,
        prompt: Option<PromptRequest>,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn ServerConnection>, OpenCodeApiError>;

    fn list_messages(
        &self,
        session_id: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<MessageWithParts>, OpenCodeApiError>;

    fn abort(&self, session_id: &str) -> Result<(), OpenCodeApiError>;
}

#[derive(Debug)]
struct DefaultServerApi {
    client: OpenCodeApiClient,
}

impl DefaultServerApi {
    fn runtime() -> Result<Runtime, OpenCodeApiError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                OpenCodeApiError::Unknown(format!("failed to initialize tokio runtime: {error}"))
            })
    }
}

impl ServerApi for DefaultServerApi {
    fn create_session(&self, cancel: &CancelSignal) -> Result<String, OpenCodeApiError> {
        let runtime = Self::runtime()?;
        let session = runtime.block_on(self.client.create_session(Some(cancel)))?;
        Ok(session.id)
    }

    fn connect(
        &self,
        session_id: &str,
        prompt: Option<PromptRequest>,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn ServerConnection>, OpenCodeApiError> {
        let runtime = Self::runtime()?;
        let subscription = runtime.block_on(self.client.subscribe_events(Some(cancel)))?;
        let prompt = prompt.map(|prompt| {
            let client = self.client.clone();
            let session_id = session_id.to_string();
            runtime.spawn(async move { client.send_prompt(&session_id, &prompt, None).await })
        });

        Ok(Box::new(DefaultConnection {
            runtime,
            subscription,
            prompt,
        }))
    }

    fn list_messages(
        &self,
        session_id: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<MessageWithParts>, OpenCodeApiError> {
        let runtime = Self::runtime()?;
        runtime.block_on(self.client.list_messages(session_id, Some(cancel)))
    }

    fn abort(&self, session_id: &str) -> Result<(), OpenCodeApiError> {
        let runtime = Self::runtime()?;
        runtime.block_on(self.client.abort(session_id, None))
    }
}

/// Event subscription plus the in-flight prompt request, both driven by a
/// runtime owned by the connection. Dropping the connection drops both.
struct DefaultConnection {
    runtime: Runtime,
    subscription: opencode_api::EventSubscription,
    prompt: Option<JoinHandle<Result<MessageWithParts, OpenCodeApiError>>>,
}

enum NextItem {
    Event(Result<Option<BusEvent>, OpenCodeApiError>),
    Prompt(Result<MessageWithParts, OpenCodeApiError>),
}

impl ServerConnection for DefaultConnection {
    fn next(&mut self, cancel: &CancelSignal) -> Result<Option<ConnectionItem>, OpenCodeApiError> {
        let Self {
            runtime,
            subscription,
            prompt,
        } = self;

        let next = runtime.block_on(async {
            match prompt.as_mut() {
                Some(handle) => tokio::select! {
                    biased;
                    event = subscription.next_event(Some(cancel)) => NextItem::Event(event),
                    joined = handle => NextItem::Prompt(joined.unwrap_or_else(|error| {
                        Err(OpenCodeApiError::Unknown(format!("prompt task failed: {error}")))
                    })),
                },
                None => NextItem::Event(subscription.next_event(Some(cancel)).await),
            }
        });

        match next {
            NextItem::Event(event) => Ok(event?.map(ConnectionItem::Bus)),
            NextItem::Prompt(result) => {
                *prompt = None;
                Ok(Some(ConnectionItem::PromptFinished(result)))
            }
        }
    }
}

/// `Transport` backed by an opencode server.
pub struct OpenCodeTransport {
    api: Arc<dyn ServerApi>,
    provider_id: String,
    model_id: String,
    session_id: Mutex<Option<String>>,
}

impl OpenCodeTransport {
    pub fn new(config: OpenCodeApiConfig) -> Result<Self, OpenCodeApiError> {
        let provider_id = config.provider_id.clone();
        let model_id = config.model_id.clone();
        let client = OpenCodeApiClient::new(config)?;
        Ok(Self::with_api(
            Arc::new(DefaultServerApi { client }),
            provider_id,
            model_id,
        ))
    }

    /// Builds a transport from `OPENCODE_*` environment variables.
    pub fn from_env() -> Result<Self, OpenCodeApiError> {
        Self::new(OpenCodeApiConfig::from_env())
    }

    fn with_api(api: Arc<dyn ServerApi>, provider_id: String, model_id: String) -> Self {
        Self {
            api,
            provider_id,
            model_id,
            session_id: Mutex::new(None),
        }
    }

    /// Server-side session currently backing the conversation, if any.
    pub fn session_id(&self) -> Option<String> {
        lock_unpoisoned(&self.session_id).clone()
    }

    /// The lock is released while the server creates the session, so
    /// `abort` and `reset` never wait on that request. A session bound by
    /// another caller in the meantime wins over the one created here.
    fn ensure_session(&self, cancel: &CancelSignal) -> Result<String, OpenCodeApiError> {
        if let Some(session_id) = self.session_id() {
            return Ok(session_id);
        }
        let created = self.api.create_session(cancel)?;

        let mut session = lock_unpoisoned(&self.session_id);
        if let Some(existing) = session.as_ref() {
            tracing::debug!(
                session_id = %existing,
                discarded = %created,
                "opencode session already bound"
            );
            return Ok(existing.clone());
        }
        tracing::info!(session_id = %created, "bound conversation to opencode session");
        *session = Some(created.clone());
        Ok(created)
    }

    fn prompt_for(&self, request: &TurnRequest) -> PromptRequest {
        let prompt = PromptRequest::text(&request.prompt, &self.provider_id, &self.model_id);
        match request.instructions.as_deref().map(str::trim) {
            Some(instructions) if !instructions.is_empty() => prompt.with_system(instructions),
            _ => prompt,
        }
    }
}

impl Transport for OpenCodeTransport {
    fn open(
        &self,
        request: &TurnRequest,
        resume: &ResumePoint,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn EventStream>, TransportFailure> {
        let session_id = self
            .ensure_session(cancel)
            .map_err(|error| map_failure(error, resume))?;

        let prompt = (!resume.request_accepted).then(|| self.prompt_for(request));
        tracing::debug!(
            turn_id = %request.turn_id,
            session_id = %session_id,
            attempt = resume.attempt,
            resubmit = prompt.is_some(),
            "opening opencode event stream"
        );

        let connection = self
            .api
            .connect(&session_id, prompt, cancel)
            .map_err(|error| map_failure(error, resume))?;
        let mut mapper = TurnEventMapper::new(&session_id, resume.request_accepted);

        if resume.request_accepted {
            let history = self
                .api
                .list_messages(&session_id, cancel)
                .map_err(|error| map_failure(error, resume))?;
            mapper.catch_up(&history, resume.received_text_len);
        }

        Ok(Box::new(OpenCodeEventStream { connection, mapper }))
    }

    fn abort(&self, request: &TurnRequest) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        if let Err(error) = self.api.abort(&session_id) {
            tracing::warn!(turn_id = %request.turn_id, %error, "failed to abort opencode session");
        }
    }

    fn reset(&self) {
        if let Some(session_id) = lock_unpoisoned(&self.session_id).take() {
            tracing::info!(session_id = %session_id, "released opencode session");
        }
    }
}

struct OpenCodeEventStream {
    connection: Box<dyn ServerConnection>,
    mapper: TurnEventMapper,
}

impl EventStream for OpenCodeEventStream {
    fn next_event(&mut self, cancel: &CancelSignal) -> Result<Option<StreamEvent>, TransportFailure> {
        loop {
            if let Some(event) = self.mapper.pop() {
                return Ok(Some(event));
            }
            if self.mapper.is_finished() {
                return Ok(None);
            }

            match self.connection.next(cancel) {
                Ok(Some(ConnectionItem::Bus(event))) => self.mapper.handle_bus_event(event),
                Ok(Some(ConnectionItem::PromptFinished(Ok(reply)))) => {
                    self.mapper.handle_prompt_reply(&reply);
                }
                Ok(Some(ConnectionItem::PromptFinished(Err(error)))) => {
                    match prompt_rejection(&error) {
                        Some(event) => self.mapper.push_terminal(event),
                        None => return Err(map_failure(error, &ResumePoint::fresh())),
                    }
                }
                Ok(None) => return Ok(None),
                Err(error) => return Err(map_failure(error, &ResumePoint::fresh())),
            }
        }
    }

    fn request_accepted(&self) -> bool {
        self.mapper.request_accepted()
    }
}

/// A prompt the server answered with a non-retryable status is a service
/// error for the turn, not a transport problem.
fn prompt_rejection(error: &OpenCodeApiError) -> Option<StreamEvent> {
    match error {
        OpenCodeApiError::Status(status, message) if !error.is_transient() => {
            Some(StreamEvent::Error {
                code: Some(status.as_u16().to_string()),
                message: message.clone(),
            })
        }
        _ => None,
    }
}

/// A server that refuses the very first connection of a turn is unreachable;
/// later connection failures, and any timeout, are treated as drops worth
/// retrying.
fn map_failure(error: OpenCodeApiError, resume: &ResumePoint) -> TransportFailure {
    if matches!(error, OpenCodeApiError::Cancelled) {
        return TransportFailure::cancelled();
    }
    if error.is_connect() && resume.is_fresh() {
        return TransportFailure::fatal(format!("opencode server unreachable: {error}"));
    }
    if error.is_transient() {
        TransportFailure::transient(error.to_string())
    } else {
        TransportFailure::fatal(error.to_string())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
