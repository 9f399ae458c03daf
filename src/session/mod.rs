//! Protocol session: turn lifecycle, streaming, cancellation and reconnection.

mod outbox;
mod state;
mod worker;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use opencode_protocol::{is_cancelled, CancelSignal, StreamEvent, Transport, TurnRequest};

use crate::config::SessionConfig;
use crate::conversation::{Conversation, ConversationSnapshot, TurnId, TurnStatus};
use crate::error::{SessionError, TurnError};
use crate::host::{HostAdapter, HostEvent};
use crate::markdown::{render_document, RenderPatch};

use outbox::{Completion, Outbox};
use state::{open_turn_pair, ActiveTurn, Flow, SessionState};

/// Streaming session over one conversation.
///
/// At most one assistant turn is in flight at a time. Each turn is read by its
/// own worker thread; every state change is applied under one lock and the
/// resulting host notifications are delivered afterwards, in order, with no
/// lock held.
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    state: Mutex<SessionState>,
    outbox: Outbox,
    host: Arc<dyn HostAdapter>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostAdapter>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::default()),
                outbox: Outbox::default(),
                host,
                transport,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Submits `user_text` and starts streaming the assistant's answer.
    ///
    /// Fails with [`SessionError::ConcurrentTurn`] while another turn is
    /// pending or streaming; the conversation is left untouched in that case.
    pub fn start_turn(&self, user_text: &str) -> Result<SessionHandle, SessionError> {
        if user_text.trim().is_empty() {
            return Err(SessionError::EmptyInput);
        }

        let handle = {
            let mut state = self.inner.lock_state();
            if let Some(active) = state.conversation.active_turn() {
                tracing::debug!(active = %active.id, "rejecting concurrent turn");
                return Err(SessionError::ConcurrentTurn {
                    active: active.id.clone(),
                });
            }

            let history = state.history();
            let (user_id, turn_id) = open_turn_pair(&mut state.conversation, user_text);
            let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
            let completion = Arc::new(Completion::default());
            let request = TurnRequest {
                turn_id: turn_id.to_string(),
                prompt: user_text.to_string(),
                history,
                instructions: self.inner.config.instructions.clone(),
            };

            let inner = Arc::clone(&self.inner);
            let worker_turn = turn_id.clone();
            let worker_cancel = Arc::clone(&cancel);
            let worker_completion = Arc::clone(&completion);
            let spawned = thread::Builder::new()
                .name(format!("opencode-turn-{turn_id}"))
                .spawn(move || {
                    worker::run_turn(inner, request, worker_turn, worker_cancel, worker_completion)
                });
            if let Err(error) = spawned {
                let kept = state.conversation.len().saturating_sub(2);
                state.conversation.truncate(kept);
                return Err(SessionError::Spawn(error));
            }

            state.active = Some(ActiveTurn::new(turn_id.clone(), Arc::clone(&cancel)));
            self.inner
                .outbox
                .push(HostEvent::Status(user_id, TurnStatus::Complete));
            self.inner
                .outbox
                .push(HostEvent::Status(turn_id.clone(), TurnStatus::Pending));
            tracing::info!(%turn_id, "turn started");

            SessionHandle {
                turn_id,
                cancel,
                completion,
                inner: Arc::clone(&self.inner),
            }
        };

        self.inner.drain();
        Ok(handle)
    }

    /// Alias of [`start_turn`](Self::start_turn) for hosts driving the
    /// session from an input box.
    pub fn submit_input(&self, text: &str) -> Result<SessionHandle, SessionError> {
        self.start_turn(text)
    }

    /// Cancels the turn behind `handle`. Does nothing if it already ended.
    pub fn cancel(&self, handle: &SessionHandle) {
        self.inner.cancel(&handle.turn_id);
    }

    /// Cancels whichever turn is in flight, if any.
    pub fn cancel_active(&self) {
        if let Some(turn_id) = self.active_turn_id() {
            self.inner.cancel(&turn_id);
        }
    }

    /// A copy of the conversation as it stands.
    pub fn conversation(&self) -> Conversation {
        self.inner.lock_state().conversation.clone()
    }

    pub fn active_turn_id(&self) -> Option<TurnId> {
        self.inner
            .lock_state()
            .conversation
            .active_turn()
            .map(|turn| turn.id.clone())
    }

    /// Re-renders a turn's full text from scratch, e.g. after an import.
    pub fn render_turn(&self, turn_id: &TurnId) -> Option<Vec<RenderPatch>> {
        let text = self
            .inner
            .lock_state()
            .conversation
            .get(turn_id)
            .map(|turn| turn.raw_text.clone())?;
        Some(render_document(&text))
    }

    /// Cancels any in-flight turn, drops every turn, and tells the transport
    /// to forget its server-side session.
    pub fn reset(&self) {
        self.cancel_active();
        {
            let mut state = self.inner.lock_state();
            state.conversation.clear();
            state.active = None;
        }
        self.inner.transport.reset();
        tracing::info!("session reset");
    }

    pub fn export_state(&self) -> ConversationSnapshot {
        self.inner.lock_state().conversation.snapshot()
    }

    /// Replaces the conversation with `snapshot`.
    ///
    /// Refused while a turn is in flight. Turns that were in flight when the
    /// snapshot was taken are restored as cancelled.
    pub fn import_state(&self, snapshot: ConversationSnapshot) -> Result<(), SessionError> {
        {
            let mut state = self.inner.lock_state();
            if let Some(active) = state.conversation.active_turn() {
                return Err(SessionError::ConcurrentTurn {
                    active: active.id.clone(),
                });
            }
            state.conversation = Conversation::restore(snapshot)?;
            state.active = None;
            tracing::info!(turns = state.conversation.len(), "conversation imported");
        }
        self.inner.transport.reset();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.inner.lock_state();
        if let Some(active) = state.active.as_ref() {
            active
                .cancel
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock_unpoisoned(&self.state)
    }

    fn drain(&self) {
        self.outbox.drain(self.host.as_ref());
    }

    fn deliver(&self, turn_id: &TurnId, event: StreamEvent) -> Flow {
        let flow = self
            .lock_state()
            .apply_event(turn_id, event, &self.outbox);
        self.drain();
        flow
    }

    fn fail(&self, turn_id: &TurnId, error: TurnError) {
        self.lock_state().fail(turn_id, error, &self.outbox);
        self.drain();
    }

    fn cancel(&self, turn_id: &TurnId) {
        let cancelled = self.lock_state().cancel(turn_id, &self.outbox);
        if cancelled {
            self.drain();
        }
    }

    fn finish_worker(&self, turn_id: &TurnId, completion: &Completion) {
        let status = self.lock_state().finish_worker(turn_id, &self.outbox);
        self.drain();
        completion.complete(status);
        tracing::debug!(%turn_id, %status, "turn worker exited");
    }
}

/// Caller's handle on one in-flight turn.
pub struct SessionHandle {
    turn_id: TurnId,
    cancel: CancelSignal,
    completion: Arc<Completion>,
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    /// True once the turn's worker has exited.
    pub fn is_finished(&self) -> bool {
        self.completion.status().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        is_cancelled(&self.cancel)
    }

    pub fn cancel(&self) {
        self.inner.cancel(&self.turn_id);
    }

    /// Blocks until the turn's worker has exited and returns the final status.
    pub fn wait(&self) -> TurnStatus {
        self.completion.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TurnStatus> {
        self.completion.wait_timeout(timeout)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("turn_id", &self.turn_id)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
