use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use opencode_session::opencode_protocol::{ResumePoint, StreamEvent, TransportFailure};
use opencode_session::{
    apply_patches, render_document, BlockKind, ConversationSnapshot, ErrorKind, HostAdapter,
    HostEvent, RecordingHost, RenderPatch, RetryPolicy, Session, SessionConfig, SessionError,
    ToolCallRecord, TurnError, TurnId, TurnStatus,
};
use opencode_transport_mock::{ChannelTransport, ScriptStep, ScriptedConnection, ScriptedTransport};
use pretty_assertions::assert_eq;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);

fn config(max_retries: u32) -> SessionConfig {
    SessionConfig::default().with_retry(RetryPolicy::immediate(max_retries))
}

fn scripted_session(transport: &Arc<ScriptedTransport>) -> (Session, Arc<RecordingHost>) {
    let host = Arc::new(RecordingHost::new());
    let session = Session::new(transport.clone(), host.clone(), config(3));
    (session, host)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn events(steps: Vec<StreamEvent>) -> Vec<ScriptStep> {
    steps.into_iter().map(ScriptStep::Event).collect()
}

#[test]
fn reply_streams_to_completion() {
    let reply = "Hello **world**\n\nSecond paragraph";
    let transport = Arc::new(ScriptedTransport::replying(reply));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);
    assert!(handle.is_finished());

    let conversation = session.conversation();
    assert_eq!(conversation.len(), 2);
    let user = &conversation.turns()[0];
    let assistant = &conversation.turns()[1];
    assert_eq!(user.raw_text, "hi");
    assert_eq!(&assistant.id, handle.turn_id());
    assert_eq!(assistant.raw_text, reply);
    assert_eq!(session.active_turn_id(), None);

    assert_eq!(host.statuses(&user.id), vec![TurnStatus::Complete]);
    assert_eq!(
        host.statuses(handle.turn_id()),
        vec![
            TurnStatus::Pending,
            TurnStatus::Streaming,
            TurnStatus::Complete
        ]
    );

    let mut expected = Vec::new();
    apply_patches(&mut expected, &render_document(reply));
    assert_eq!(host.blocks(handle.turn_id()), expected);
    assert!(host.errors().is_empty());
}

#[test]
fn cancel_after_completion_changes_nothing() {
    let transport = Arc::new(ScriptedTransport::single(events(vec![
        StreamEvent::text("All done."),
        StreamEvent::Done,
    ])));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);
    let seen = host.events().len();

    session.cancel(&handle);
    session.cancel(&handle);
    handle.cancel();

    assert_eq!(host.events().len(), seen);
    assert!(!handle.is_cancelled());
    assert_eq!(handle.wait(), TurnStatus::Complete);
    let conversation = session.conversation();
    let turn = conversation.get(handle.turn_id()).expect("assistant turn");
    assert_eq!(turn.status, TurnStatus::Complete);
    assert_eq!(turn.raw_text, "All done.");
    assert_eq!(transport.abort_count(), 0);
}

#[test]
fn streamed_table_is_revealed_only_after_its_separator() {
    let transport = Arc::new(ScriptedTransport::single(events(vec![
        StreamEvent::text("| a | b |\n"),
        StreamEvent::text("|---|---|\n"),
        StreamEvent::text("| 1 | 2 |\n"),
        StreamEvent::Done,
    ])));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("table please").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let patches = host.patches(handle.turn_id());
    assert_eq!(patches.len(), 4, "{patches:#?}");
    assert!(matches!(patches[0], RenderPatch::AppendBlock { index: 0, .. }));
    assert_eq!(
        patches[0].block().map(|block| block.kind.clone()),
        Some(BlockKind::Paragraph)
    );
    for (patch, rows) in patches[1..3].iter().zip([1, 2]) {
        assert!(matches!(patch, RenderPatch::ReplaceBlock { index: 0, .. }));
        let block = patch.block().expect("table block");
        assert_eq!(block.kind, BlockKind::Table);
        assert_eq!(block.table.as_ref().map(|shape| shape.rows.len()), Some(rows));
    }
    assert_eq!(patches[3], RenderPatch::FinalizeBlock { index: 0 });
}

#[test]
fn service_error_keeps_partial_output() {
    let transport = Arc::new(ScriptedTransport::single(events(vec![
        StreamEvent::text("Hello "),
        StreamEvent::Error {
            code: Some("overloaded".to_string()),
            message: "model is overloaded".to_string(),
        },
        StreamEvent::text("never shown"),
    ])));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Errored);

    let conversation = session.conversation();
    let turn = conversation.get(handle.turn_id()).expect("assistant turn");
    assert_eq!(turn.raw_text, "Hello ");
    assert_eq!(
        turn.error,
        Some(
            TurnError::new(ErrorKind::ServiceError, "model is overloaded")
                .with_code(Some("overloaded".to_string()))
        )
    );

    let errors = host.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1.kind, ErrorKind::ServiceError);

    let patches = host.patches(handle.turn_id());
    assert_eq!(patches.last(), Some(&RenderPatch::FinalizeBlock { index: 0 }));
    let blocks = host.blocks(handle.turn_id());
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].source, "Hello ");
    assert!(!blocks[0].provisional);
    assert_eq!(transport.open_count(), 1);
}

#[test]
fn transient_failures_stop_after_the_retry_limit() {
    let transport = Arc::new(ScriptedTransport::always_failing(
        TransportFailure::transient("connection reset"),
    ));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Errored);

    assert_eq!(transport.open_count(), 4);
    let attempts: Vec<u32> = transport
        .opens()
        .iter()
        .map(|open| open.resume.attempt)
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);

    let errors = host.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1.kind, ErrorKind::TransportExhausted);
    assert!(errors[0].1.message.contains("connection reset"));
}

#[test]
fn fatal_connect_failure_errors_the_turn_without_retrying() {
    let transport = Arc::new(ScriptedTransport::always_failing(TransportFailure::fatal(
        "connection refused",
    )));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Errored);

    assert_eq!(transport.open_count(), 1);
    assert_eq!(
        host.statuses(handle.turn_id()),
        vec![TurnStatus::Pending, TurnStatus::Errored]
    );
    let errors = host.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1.kind, ErrorKind::TransportError);
    assert!(host.patches(handle.turn_id()).is_empty());
}

#[test]
fn protocol_failure_is_reported_as_a_violation() {
    let transport = Arc::new(ScriptedTransport::always_failing(
        TransportFailure::protocol("event for unknown session"),
    ));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Errored);
    assert_eq!(host.errors()[0].1.kind, ErrorKind::ProtocolViolation);
}

#[test]
fn reconnects_resume_after_delivered_text() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedConnection::Stream(vec![
            ScriptStep::Event(StreamEvent::text("Hello ")),
            ScriptStep::Fail(TransportFailure::transient("read timed out")),
        ]),
        ScriptedConnection::Stream(vec![
            ScriptStep::Event(StreamEvent::text("big ")),
            ScriptStep::Fail(TransportFailure::transient("read timed out")),
        ]),
        ScriptedConnection::Stream(events(vec![
            StreamEvent::text("world"),
            StreamEvent::Done,
        ])),
    ]));
    let host = Arc::new(RecordingHost::new());
    // One retry is enough because every reconnect delivers an event.
    let session = Session::new(transport.clone(), host.clone(), config(1));

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let resumes: Vec<ResumePoint> = transport.opens().iter().map(|open| open.resume).collect();
    assert_eq!(
        resumes,
        vec![
            ResumePoint::fresh(),
            ResumePoint {
                attempt: 1,
                received_text_len: 6,
                request_accepted: true,
            },
            ResumePoint {
                attempt: 2,
                received_text_len: 10,
                request_accepted: true,
            },
        ]
    );
    assert_eq!(
        session
            .conversation()
            .get(handle.turn_id())
            .map(|turn| turn.raw_text.clone()),
        Some("Hello big world".to_string())
    );
    assert!(host.errors().is_empty());
}

#[test]
fn cancel_is_idempotent_and_aborts_the_remote_turn() {
    let (transport, sender) = ChannelTransport::new();
    let transport = Arc::new(transport);
    let host = Arc::new(RecordingHost::new());
    let session = Session::new(transport.clone(), host.clone(), config(3));

    let handle = session.start_turn("hi").expect("start turn");
    sender
        .send(Ok(StreamEvent::text("partial answer\nstill typ")))
        .expect("send delta");
    wait_until(|| host.statuses(handle.turn_id()).contains(&TurnStatus::Streaming));

    handle.cancel();
    session.cancel(&handle);
    assert_eq!(handle.wait(), TurnStatus::Cancelled);
    assert!(handle.is_cancelled());
    assert_eq!(transport.abort_count(), 1);

    let statuses = host.statuses(handle.turn_id());
    assert_eq!(
        statuses,
        vec![
            TurnStatus::Pending,
            TurnStatus::Streaming,
            TurnStatus::Cancelled
        ]
    );
    assert!(host
        .patches(handle.turn_id())
        .iter()
        .any(|patch| matches!(patch, RenderPatch::FinalizeBlock { .. })));

    let seen = host.events().len();
    session.cancel(&handle);
    session.cancel_active();
    assert_eq!(host.events().len(), seen);

    sender
        .send(Ok(StreamEvent::text("late")))
        .expect("transport still holds the receiver");
    assert_eq!(
        session
            .conversation()
            .get(handle.turn_id())
            .map(|turn| turn.raw_text.clone()),
        Some("partial answer\nstill typ".to_string())
    );
}

#[test]
fn second_turn_is_rejected_while_one_is_in_flight() {
    let (transport, sender) = ChannelTransport::new();
    let host = Arc::new(RecordingHost::new());
    let session = Session::new(Arc::new(transport), host.clone(), config(3));

    let handle = session.start_turn("first").expect("start turn");
    let rejected = session.start_turn("second");
    match rejected {
        Err(SessionError::ConcurrentTurn { active }) => assert_eq!(&active, handle.turn_id()),
        other => panic!("expected concurrent turn rejection, got {other:?}"),
    }
    assert_eq!(
        session.submit_input("third").map(|_| ()).map_err(|error| error.kind()),
        Err(Some(ErrorKind::ConcurrentTurnError))
    );
    assert_eq!(session.conversation().len(), 2);
    assert_eq!(session.active_turn_id().as_ref(), Some(handle.turn_id()));

    sender.send(Ok(StreamEvent::Done)).expect("send done");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let next = session.start_turn("second").expect("start after completion");
    sender.send(Ok(StreamEvent::Done)).expect("send done");
    assert_eq!(next.wait(), TurnStatus::Complete);
    assert_eq!(session.conversation().len(), 4);
}

#[test]
fn empty_input_is_rejected() {
    let transport = Arc::new(ScriptedTransport::replying("unused"));
    let (session, host) = scripted_session(&transport);

    assert!(matches!(
        session.start_turn("  \n\t"),
        Err(SessionError::EmptyInput)
    ));
    assert!(session.conversation().is_empty());
    assert!(host.events().is_empty());
    assert_eq!(transport.open_count(), 0);
}

#[test]
fn later_turns_carry_completed_history() {
    let transport = Arc::new(ScriptedTransport::replying("answer"));
    let (session, _host) = scripted_session(&transport);

    let first = session.start_turn("one").expect("first turn");
    assert_eq!(first.wait(), TurnStatus::Complete);
    let second = session.start_turn("two").expect("second turn");
    assert_eq!(second.wait(), TurnStatus::Complete);

    let opens = transport.opens();
    assert_eq!(opens[0].history_len, 0);
    assert_eq!(opens[1].history_len, 2);
    assert_eq!(opens[1].prompt, "two");
    assert_eq!(opens[1].turn_id, second.turn_id().to_string());
}

#[test]
fn tool_calls_are_recorded_but_not_rendered() {
    let transport = Arc::new(ScriptedTransport::single(events(vec![
        StreamEvent::ToolCallStart {
            call_id: "call-1".to_string(),
            tool_name: "read".to_string(),
            input: json!({ "path": "README.md" }),
        },
        StreamEvent::ToolCallEnd {
            call_id: "call-1".to_string(),
            output: Some("# Title".to_string()),
            is_error: false,
        },
        StreamEvent::text("Done reading."),
        StreamEvent::Done,
    ])));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("read it").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let conversation = session.conversation();
    let turn = conversation.get(handle.turn_id()).expect("assistant turn");
    assert_eq!(turn.raw_text, "Done reading.");
    let record = turn.tool_call("call-1").expect("tool call");
    assert!(record.finished);
    assert_eq!(record.output.as_deref(), Some("# Title"));

    let tool_events: Vec<ToolCallRecord> = host
        .events()
        .into_iter()
        .filter_map(|event| match event {
            HostEvent::ToolCall(_, record) => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(tool_events.len(), 2);
    assert!(!tool_events[0].finished);
    assert!(tool_events[1].finished);

    let blocks = host.blocks(handle.turn_id());
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].source, "Done reading.");
}

#[test]
fn showcase_patch_indices_never_decrease() {
    let transport = Arc::new(ScriptedTransport::default());
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("show me").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let patches = host.patches(handle.turn_id());
    assert!(patches.len() > 10);
    assert!(patches
        .windows(2)
        .all(|pair| pair[0].index() <= pair[1].index()));
    let finalized = patches
        .iter()
        .filter(|patch| matches!(patch, RenderPatch::FinalizeBlock { .. }))
        .count();
    assert_eq!(finalized, host.blocks(handle.turn_id()).len());
}

#[test]
fn reset_drops_turns_and_server_state() {
    let transport = Arc::new(ScriptedTransport::replying("answer"));
    let (session, _host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    session.reset();
    assert!(session.conversation().is_empty());
    assert_eq!(transport.reset_count(), 1);

    let next = session.start_turn("again").expect("start after reset");
    assert_eq!(next.wait(), TurnStatus::Complete);
    assert_eq!(transport.opens()[1].history_len, 0);
}

#[test]
fn reset_cancels_the_turn_in_flight() {
    let transport = Arc::new(ScriptedTransport::single(vec![
        ScriptStep::Event(StreamEvent::text("thinking")),
        ScriptStep::Hang,
    ]));
    let (session, host) = scripted_session(&transport);

    let handle = session.start_turn("hi").expect("start turn");
    wait_until(|| host.statuses(handle.turn_id()).contains(&TurnStatus::Streaming));

    session.reset();
    assert_eq!(handle.wait(), TurnStatus::Cancelled);
    assert!(session.conversation().is_empty());
    assert_eq!(transport.abort_count(), 1);
}

#[test]
fn exported_state_restores_into_a_new_session() {
    let reply = "# Title\n\n- one\n- two\n";
    let transport = Arc::new(ScriptedTransport::replying(reply));
    let (session, host) = scripted_session(&transport);
    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let json = session.export_state().to_json().expect("serialize snapshot");
    let snapshot = ConversationSnapshot::from_json(&json).expect("parse snapshot");

    let restored_transport = Arc::new(ScriptedTransport::replying("unused"));
    let (restored, _restored_host) = scripted_session(&restored_transport);
    restored.import_state(snapshot).expect("import snapshot");
    assert_eq!(restored.conversation(), session.conversation());
    assert_eq!(restored_transport.reset_count(), 1);

    let patches = restored
        .render_turn(handle.turn_id())
        .expect("turn exists after import");
    let mut blocks = Vec::new();
    apply_patches(&mut blocks, &patches);
    assert_eq!(blocks, host.blocks(handle.turn_id()));
    assert_eq!(restored.render_turn(&TurnId::from("missing")), None);
}

#[test]
fn import_is_refused_while_a_turn_streams_or_for_unknown_versions() {
    let (transport, sender) = ChannelTransport::new();
    let session = Session::new(
        Arc::new(transport),
        Arc::new(RecordingHost::new()),
        config(3),
    );
    let handle = session.start_turn("hi").expect("start turn");

    let busy = session.import_state(ConversationSnapshot {
        version: opencode_session::SNAPSHOT_VERSION,
        turns: Vec::new(),
    });
    assert!(matches!(busy, Err(SessionError::ConcurrentTurn { .. })));

    sender.send(Ok(StreamEvent::Done)).expect("send done");
    assert_eq!(handle.wait(), TurnStatus::Complete);

    let future = session.import_state(ConversationSnapshot {
        version: 99,
        turns: Vec::new(),
    });
    assert!(matches!(
        future,
        Err(SessionError::UnsupportedSnapshot {
            found: 99,
            expected: 1
        })
    ));
    assert_eq!(session.conversation().len(), 2);
}

/// Host that cancels the active turn from inside its first streaming
/// notification.
#[derive(Default)]
struct CancellingHost {
    session: Mutex<Option<Arc<Session>>>,
    recorded: RecordingHost,
}

impl HostAdapter for CancellingHost {
    fn on_render_patch(&self, turn_id: &TurnId, patch: &RenderPatch) {
        self.recorded.on_render_patch(turn_id, patch);
    }

    fn on_status_change(&self, turn_id: &TurnId, status: TurnStatus) {
        self.recorded.on_status_change(turn_id, status);
        if status == TurnStatus::Streaming {
            let session = self.session.lock().expect("session slot").clone();
            if let Some(session) = session {
                session.cancel_active();
            }
        }
    }

    fn on_error(&self, turn_id: &TurnId, error: &TurnError) {
        self.recorded.on_error(turn_id, error);
    }
}

#[test]
fn host_may_cancel_from_inside_a_callback() {
    let transport = Arc::new(ScriptedTransport::single(vec![
        ScriptStep::Event(StreamEvent::text("first words")),
        ScriptStep::Hang,
    ]));
    let host = Arc::new(CancellingHost::default());
    let session = Arc::new(Session::new(transport.clone(), host.clone(), config(3)));
    *host.session.lock().expect("session slot") = Some(Arc::clone(&session));

    let handle = session.start_turn("hi").expect("start turn");
    assert_eq!(handle.wait(), TurnStatus::Cancelled);

    let events = host.recorded.events();
    let streaming = events
        .iter()
        .position(|event| matches!(event, HostEvent::Status(_, TurnStatus::Streaming)))
        .expect("streaming status");
    let cancelled = events
        .iter()
        .position(|event| matches!(event, HostEvent::Status(_, TurnStatus::Cancelled)))
        .expect("cancelled status");
    assert!(streaming < cancelled);
    assert!(matches!(
        events[streaming + 1],
        HostEvent::Patch(_, RenderPatch::AppendBlock { index: 0, .. })
    ));

    host.session.lock().expect("session slot").take();
}
