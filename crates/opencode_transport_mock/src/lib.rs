//! Deterministic mock implementations of the `opencode_protocol` transport contract.
//!
//! This crate contains no network code and is intended for local development
//! and session-level integration testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use opencode_protocol::{
    is_cancelled, CancelSignal, EventStream, ResumePoint, StreamEvent, Transport,
    TransportFailure, TurnRequest,
};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One scripted action of a mock connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Event(StreamEvent),
    Delay(Duration),
    /// Ends the connection with `failure`.
    Fail(TransportFailure),
    /// Blocks until the turn is cancelled.
    Hang,
}

/// Outcome of one `Transport::open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedConnection {
    Stream(Vec<ScriptStep>),
    Refuse(TransportFailure),
}

/// Arguments observed by one `Transport::open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub turn_id: String,
    pub prompt: String,
    pub history_len: usize,
    pub resume: ResumePoint,
}

/// Transport replaying pre-scripted connections in order.
///
/// Once the script is exhausted every further `open` uses the fallback
/// connection, which refuses by default.
#[derive(Debug)]
pub struct ScriptedTransport {
    connections: Mutex<VecDeque<ScriptedConnection>>,
    fallback: ScriptedConnection,
    opens: Mutex<Vec<OpenRecord>>,
    aborts: AtomicUsize,
    resets: AtomicUsize,
}

impl ScriptedTransport {
    /// Creates a transport with caller-provided connections.
    #[must_use]
    pub fn new(connections: Vec<ScriptedConnection>) -> Self {
        Self {
            connections: Mutex::new(connections.into()),
            fallback: ScriptedConnection::Refuse(TransportFailure::fatal(
                "no scripted connection left",
            )),
            opens: Mutex::new(Vec::new()),
            aborts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    /// Creates a transport whose single connection streams `steps`.
    #[must_use]
    pub fn single(steps: Vec<ScriptStep>) -> Self {
        Self::new(vec![ScriptedConnection::Stream(steps)])
    }

    /// Creates a transport answering every turn with `reply`, tokenized, then `Done`.
    #[must_use]
    pub fn replying(reply: &str) -> Self {
        let mut steps = tokenize_reply(reply);
        steps.push(ScriptStep::Event(StreamEvent::Done));
        Self::new(Vec::new()).with_fallback(ScriptedConnection::Stream(steps))
    }

    /// Creates a transport whose every connection fails with `failure`.
    #[must_use]
    pub fn always_failing(failure: TransportFailure) -> Self {
        Self::new(Vec::new()).with_fallback(ScriptedConnection::Refuse(failure))
    }

    /// Replaces the connection used once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, fallback: ScriptedConnection) -> Self {
        self.fallback = fallback;
        self
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> usize {
        lock_unpoisoned(&self.opens).len()
    }

    /// Arguments of every `open` call, in call order.
    pub fn opens(&self) -> Vec<OpenRecord> {
        lock_unpoisoned(&self.opens).clone()
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::Acquire)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Acquire)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::replying(concat!(
            "# Streaming showcase\n",
            "A deterministic reply exercising **inline styles**, `code`, and block structure.\n",
            "\n",
            "## Lists\n",
            "- Unordered item one\n",
            "  - Nested unordered item\n",
            "1. Ordered step one\n",
            "2. Ordered step two\n",
            "\n",
            "> Quoted text spanning\n",
            "> two lines.\n",
            "\n",
            "```rust\n",
            "fn main() {\n",
            "    println!(\"Hello, Markdown\");\n",
            "}\n",
            "```\n",
            "\n",
            "| Feature | Supported |\n",
            "| :--- | ---: |\n",
            "| Tables | yes |\n",
            "| Code fences | yes |\n",
            "\n",
            "---\n",
            "\n",
            "Completed successfully.\n",
        ))
    }
}

impl Transport for ScriptedTransport {
    fn open(
        &self,
        request: &TurnRequest,
        resume: &ResumePoint,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn EventStream>, TransportFailure> {
        lock_unpoisoned(&self.opens).push(OpenRecord {
            turn_id: request.turn_id.clone(),
            prompt: request.prompt.clone(),
            history_len: request.history.len(),
            resume: *resume,
        });

        if is_cancelled(cancel) {
            return Err(TransportFailure::cancelled());
        }

        let connection = lock_unpoisoned(&self.connections)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match connection {
            ScriptedConnection::Stream(steps) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
                accepted: false,
            })),
            ScriptedConnection::Refuse(failure) => Err(failure),
        }
    }

    fn abort(&self, _request: &TurnRequest) {
        self.aborts.fetch_add(1, Ordering::AcqRel);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::AcqRel);
    }
}

struct ScriptedStream {
    steps: VecDeque<ScriptStep>,
    accepted: bool,
}

impl EventStream for ScriptedStream {
    fn next_event(&mut self, cancel: &CancelSignal) -> Result<Option<StreamEvent>, TransportFailure> {
        loop {
            if is_cancelled(cancel) {
                return Err(TransportFailure::cancelled());
            }

            let Some(step) = self.steps.pop_front() else {
                return Ok(None);
            };
            self.accepted = true;

            match step {
                ScriptStep::Event(event) => return Ok(Some(event)),
                ScriptStep::Delay(delay) => sleep_unless_cancelled(delay, cancel),
                ScriptStep::Fail(failure) => {
                    self.steps.clear();
                    return Err(failure);
                }
                ScriptStep::Hang => {
                    while !is_cancelled(cancel) {
                        thread::sleep(CANCEL_POLL_INTERVAL);
                    }
                }
            }
        }
    }

    fn request_accepted(&self) -> bool {
        self.accepted
    }
}

/// Item pushed into a [`ChannelTransport`].
pub type ChannelItem = Result<StreamEvent, TransportFailure>;

/// Transport fed step by step from a test thread.
///
/// All connections share one channel; an `Err` item ends the current
/// connection with that failure and dropping every sender ends it cleanly.
#[derive(Debug)]
pub struct ChannelTransport {
    receiver: Arc<Mutex<Receiver<ChannelItem>>>,
    opens: AtomicUsize,
    aborts: AtomicUsize,
}

impl ChannelTransport {
    /// Creates a transport and the sender that feeds it.
    #[must_use]
    pub fn new() -> (Self, Sender<ChannelItem>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                receiver: Arc::new(Mutex::new(receiver)),
                opens: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
            },
            sender,
        )
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::Acquire)
    }
}

impl Transport for ChannelTransport {
    fn open(
        &self,
        _request: &TurnRequest,
        _resume: &ResumePoint,
        _cancel: &CancelSignal,
    ) -> Result<Box<dyn EventStream>, TransportFailure> {
        self.opens.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ChannelStream {
            receiver: Arc::clone(&self.receiver),
        }))
    }

    fn abort(&self, _request: &TurnRequest) {
        self.aborts.fetch_add(1, Ordering::AcqRel);
    }
}

struct ChannelStream {
    receiver: Arc<Mutex<Receiver<ChannelItem>>>,
}

impl EventStream for ChannelStream {
    fn next_event(&mut self, cancel: &CancelSignal) -> Result<Option<StreamEvent>, TransportFailure> {
        let receiver = lock_unpoisoned(&self.receiver);
        loop {
            if is_cancelled(cancel) {
                return Err(TransportFailure::cancelled());
            }
            match receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(item) => return item.map(Some),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

/// Splits `reply` into text-delta steps ending at spaces and newlines.
#[must_use]
pub fn tokenize_reply(reply: &str) -> Vec<ScriptStep> {
    let mut steps = Vec::new();
    let mut pending_token = String::new();

    for ch in reply.chars() {
        pending_token.push(ch);
        if matches!(ch, ' ' | '\n') {
            steps.push(ScriptStep::Event(StreamEvent::text(std::mem::take(
                &mut pending_token,
            ))));
        }
    }
    if !pending_token.is_empty() {
        steps.push(ScriptStep::Event(StreamEvent::text(pending_token)));
    }

    steps
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelSignal) {
    let mut remaining = delay;
    while !remaining.is_zero() && !is_cancelled(cancel) {
        let slice = remaining.min(CANCEL_POLL_INTERVAL);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
