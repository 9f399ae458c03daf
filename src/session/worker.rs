//! Per-turn worker: opens the transport, feeds events into the session, and
//! reconnects after transient failures.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use opencode_protocol::{
    is_cancelled, CancelSignal, ResumePoint, StreamEvent, TransportFailure, TransportFailureKind,
    TurnRequest,
};

use crate::conversation::TurnId;
use crate::error::{ErrorKind, TurnError};

use super::outbox::Completion;
use super::state::Flow;
use super::SessionInner;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(super) fn run_turn(
    inner: Arc<SessionInner>,
    request: TurnRequest,
    turn_id: TurnId,
    cancel: CancelSignal,
    completion: Arc<Completion>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        drive_turn(&inner, &request, &turn_id, &cancel)
    }));
    if outcome.is_err() {
        inner.fail(
            &turn_id,
            TurnError::new(ErrorKind::TransportError, "transport panicked"),
        );
    }

    if is_cancelled(&cancel) {
        tracing::debug!(%turn_id, "asking transport to abort cancelled turn");
        let aborted = catch_unwind(AssertUnwindSafe(|| inner.transport.abort(&request)));
        if aborted.is_err() {
            tracing::warn!(%turn_id, "transport panicked while aborting");
        }
    }

    inner.finish_worker(&turn_id, &completion);
}

fn drive_turn(inner: &SessionInner, request: &TurnRequest, turn_id: &TurnId, cancel: &CancelSignal) {
    let policy = &inner.config.retry;
    let mut resume = ResumePoint::fresh();
    let mut failures: u32 = 0;

    loop {
        if is_cancelled(cancel) {
            return;
        }

        let failure = match inner.transport.open(request, &resume, cancel) {
            Ok(mut stream) => {
                tracing::debug!(%turn_id, attempt = resume.attempt, "transport connected");
                let failure = loop {
                    match stream.next_event(cancel) {
                        Ok(Some(event)) => {
                            failures = 0;
                            if let StreamEvent::TextDelta { text } = &event {
                                resume.received_text_len += text.len();
                            }
                            if inner.deliver(turn_id, event) == Flow::Stop {
                                return;
                            }
                        }
                        Ok(None) => {
                            break TransportFailure::transient(
                                "stream ended before the turn finished",
                            )
                        }
                        Err(failure) => break failure,
                    }
                };
                resume.request_accepted |= stream.request_accepted();
                failure
            }
            Err(failure) => failure,
        };

        if is_cancelled(cancel) {
            return;
        }

        match failure.kind() {
            TransportFailureKind::Cancelled => return,
            TransportFailureKind::Fatal => {
                inner.fail(
                    turn_id,
                    TurnError::new(ErrorKind::TransportError, failure.message()),
                );
                return;
            }
            TransportFailureKind::Protocol => {
                inner.fail(
                    turn_id,
                    TurnError::new(ErrorKind::ProtocolViolation, failure.message()),
                );
                return;
            }
            TransportFailureKind::Transient => {}
        }

        failures += 1;
        if failures > policy.max_retries {
            inner.fail(
                turn_id,
                TurnError::new(
                    ErrorKind::TransportExhausted,
                    format!(
                        "gave up after {} consecutive failed attempts: {}",
                        failures,
                        failure.message()
                    ),
                ),
            );
            return;
        }

        let delay = policy.delay_for(failures);
        tracing::warn!(
            %turn_id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "transient transport failure; reconnecting"
        );
        if !sleep_unless_cancelled(delay, cancel) {
            return;
        }
        resume.attempt += 1;
    }
}

/// Sleeps for `delay` in short slices. Returns false if `cancel` was raised.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelSignal) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if is_cancelled(cancel) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
}
