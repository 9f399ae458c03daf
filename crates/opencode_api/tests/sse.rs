use opencode_api::events::BusEvent;
use opencode_api::SseStreamParser;
use pretty_assertions::assert_eq;

#[test]
fn part_updates_carry_part_and_delta() {
    let events = SseStreamParser::parse_frames(concat!(
        "data: {\"type\":\"message.part.updated\",\"properties\":{\"part\":",
        "{\"id\":\"prt_1\",\"messageID\":\"msg_1\",\"sessionID\":\"ses_1\",\"type\":\"text\",\"text\":\"Hel\"},",
        "\"delta\":\"Hel\"}}\n\n",
    ));

    assert_eq!(events.len(), 1);
    let BusEvent::MessagePartUpdated { part, delta } = &events[0] else {
        panic!("expected part update, got {:?}", events[0]);
    };
    assert_eq!(part.id, "prt_1");
    assert_eq!(part.text.as_deref(), Some("Hel"));
    assert_eq!(delta.as_deref(), Some("Hel"));
    assert_eq!(events[0].session_id(), Some("ses_1"));
}

#[test]
fn message_updates_and_session_events_are_mapped() {
    let events = SseStreamParser::parse_frames(concat!(
        "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
        "data: {\"type\":\"message.updated\",\"properties\":{\"info\":",
        "{\"id\":\"msg_1\",\"sessionID\":\"ses_1\",\"role\":\"assistant\",\"time\":{\"created\":1}}}}\n\n",
        "data: {\"type\":\"session.error\",\"properties\":{\"sessionID\":\"ses_1\",",
        "\"error\":{\"name\":\"APIError\",\"data\":{\"message\":\"overloaded\"}}}}\n\n",
        "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_1\"}}\n\n",
    ));

    assert_eq!(events.len(), 4);
    assert_eq!(events[0], BusEvent::ServerConnected);
    assert!(matches!(&events[1], BusEvent::MessageUpdated { info } if info.is_assistant()));
    match &events[2] {
        BusEvent::SessionError { session_id, error } => {
            assert_eq!(session_id.as_deref(), Some("ses_1"));
            assert_eq!(
                error.as_ref().map(|error| error.describe()),
                Some("overloaded".to_string())
            );
        }
        other => panic!("expected session error, got {other:?}"),
    }
    assert_eq!(
        events[3],
        BusEvent::SessionIdle {
            session_id: "ses_1".to_string()
        }
    );
}

#[test]
fn event_name_line_is_used_when_payload_has_no_type() {
    let events = SseStreamParser::parse_frames(
        "event: session.idle\ndata: {\"properties\":{\"sessionID\":\"ses_9\"}}\n\n",
    );
    assert_eq!(
        events,
        vec![BusEvent::SessionIdle {
            session_id: "ses_9".to_string()
        }]
    );
}

#[test]
fn crlf_framing_is_accepted() {
    let events = SseStreamParser::parse_frames(
        "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_1\"}}\r\n\r\n",
    );
    assert_eq!(events.len(), 1);
}

#[test]
fn malformed_and_empty_frames_are_skipped() {
    let events = SseStreamParser::parse_frames(concat!(
        "data: not-json\n\n",
        "data:\n\n",
        ": keep-alive comment\n\n",
        "data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_1\"}}\n\n",
    ));
    assert_eq!(events.len(), 1);
}

#[test]
fn unknown_and_misshapen_events_are_kept_as_unknown() {
    let events = SseStreamParser::parse_frames(concat!(
        "data: {\"type\":\"lsp.diagnostics\",\"properties\":{\"path\":\"a.rs\"}}\n\n",
        "data: {\"type\":\"message.updated\",\"properties\":{\"info\":{\"id\":1}}}\n\n",
    ));

    assert_eq!(events.len(), 2);
    assert!(
        matches!(&events[0], BusEvent::Unknown { event_type, .. } if event_type == "lsp.diagnostics")
    );
    assert!(
        matches!(&events[1], BusEvent::Unknown { event_type, .. } if event_type == "message.updated")
    );
    assert_eq!(events[0].session_id(), None);
}

#[test]
fn multi_line_data_is_joined() {
    let events = SseStreamParser::parse_frames(
        "data: {\"type\":\"session.idle\",\ndata: \"properties\":{\"sessionID\":\"ses_1\"}}\n\n",
    );
    assert_eq!(events.len(), 1);
}
