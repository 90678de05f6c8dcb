//! End-to-end session flows against the in-process server

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use taskroom_core::events::{
    AGENT_PROGRESS, AGENT_RESPONSE, AGENT_THOUGHT, AGENT_TOOL_CALL, AGENT_TOOL_RESULT,
    INSTRUCTION_ERROR, INSTRUCTION_RECEIVED, JOINED, JOIN_TASK, SEND_INSTRUCTION,
};
use taskroom_core::transport::DisconnectReason;
use taskroom_core::{
    AssemblerOutput, Client, ClientConfig, InProcessServer, InProcessTransport, InstructionError,
    Message, ReconnectState, SessionError, StreamKind, TaskSession, TaskStatus,
};

fn client() -> (Client, InProcessServer) {
    let (transport, server) = InProcessTransport::new_pair();
    let client = Client::new(ClientConfig::with_url("memory://"), Box::new(transport));
    (client, server)
}

/// Apply the next `events` agent events
async fn pump(session: &mut TaskSession, events: usize) -> Vec<AssemblerOutput> {
    let mut outputs = Vec::new();
    for _ in 0..events {
        outputs.extend(session.next().await.expect("session closed"));
    }
    outputs
}

#[tokio::test(start_paused = true)]
async fn thought_stream_yields_one_message_and_empty_buffer() {
    let (client, server) = client();
    let mut session = client.open_session("t1").await.unwrap();

    server.emit(AGENT_THOUGHT, json!({"type": "start", "run_id": "r1"}));
    server.emit(AGENT_THOUGHT, json!({"type": "token", "token": "Hi", "run_id": "r1"}));
    server.emit(AGENT_THOUGHT, json!({"type": "end", "run_id": "r1"}));
    let outputs = pump(&mut session, 3).await;

    let messages: Vec<_> = outputs
        .iter()
        .filter_map(|o| match o {
            AssemblerOutput::Message(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec![Message::Thought {
            content: "Hi".into()
        }]
    );
    assert!(session.buffer(StreamKind::Thought).is_empty());
    assert!(!session.buffer(StreamKind::Thought).is_active());
}

#[tokio::test(start_paused = true)]
async fn error_is_terminal_and_late_complete_is_flagged() {
    let (client, server) = client();
    let mut session = client.open_session("t1").await.unwrap();
    session.begin();

    server.emit(AGENT_PROGRESS, json!({"type": "start"}));
    server.emit(AGENT_PROGRESS, json!({"type": "error", "error": "boom"}));
    pump(&mut session, 2).await;
    assert_eq!(session.status(), TaskStatus::Error);
    assert_eq!(session.task().error.as_deref(), Some("boom"));

    server.emit(AGENT_PROGRESS, json!({"type": "complete", "output": "done"}));
    let outputs = pump(&mut session, 1).await;

    assert_eq!(session.status(), TaskStatus::Error);
    assert!(outputs.iter().any(|o| matches!(
        o,
        AssemblerOutput::TransitionRejected {
            from: TaskStatus::Error,
            to: TaskStatus::Complete
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn full_run_produces_ordered_transcript() {
    let (client, server) = client();
    let mut session = client.open_session("t1").await.unwrap();
    session.begin();

    server.emit(AGENT_PROGRESS, json!({"type": "start"}));
    server.emit(AGENT_TOOL_CALL, json!({"type": "start", "tool": "search", "input": "tide pools"}));
    server.emit(AGENT_TOOL_RESULT, json!({"type": "end", "output": "3 results"}));
    server.emit(AGENT_RESPONSE, json!({"type": "start"}));
    server.emit(AGENT_RESPONSE, json!({"type": "token", "token": "Tide "}));
    server.emit(AGENT_RESPONSE, json!({"type": "token", "token": "pools."}));
    server.emit(AGENT_RESPONSE, json!({"type": "end"}));
    server.emit(AGENT_PROGRESS, json!({"type": "complete", "output": "Tide pools."}));
    pump(&mut session, 8).await;

    assert_eq!(session.status(), TaskStatus::Complete);
    let kinds: Vec<_> = session.messages().iter().map(Message::kind).collect();
    assert_eq!(
        kinds,
        vec!["progress", "tool_call", "tool_result", "response", "progress"]
    );
    assert!(session.messages().contains(&Message::Response {
        content: "Tide pools.".into()
    }));
    assert!(session.buffer(StreamKind::Response).is_empty());
}

#[tokio::test(start_paused = true)]
async fn join_resolves_within_two_seconds_without_ack() {
    let (client, server) = client();
    client.connect().await.unwrap();

    let started = tokio::time::Instant::now();
    client
        .rooms()
        .join_task(&"t1".into())
        .await
        .expect("tolerant join succeeds");

    assert!(started.elapsed() <= Duration::from_millis(2000));
    assert_eq!(server.expect_emit(JOIN_TASK).await, Some(json!({"task_id": "t1"})));
}

#[tokio::test(start_paused = true)]
async fn join_returns_as_soon_as_ack_arrives() {
    let (client, server) = client();
    client.connect().await.unwrap();

    tokio::spawn({
        let server = server.clone();
        async move {
            server.expect_emit(JOIN_TASK).await;
            server.emit(JOINED, json!({"task_id": "t1"}));
        }
    });

    let started = tokio::time::Instant::now();
    client.rooms().join_task(&"t1".into()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn instruction_error_wins_and_late_success_is_ignored() {
    let (client, server) = client();
    let mut session = client.open_session("t1").await.unwrap();

    tokio::spawn({
        let server = server.clone();
        async move {
            server.expect_emit(SEND_INSTRUCTION).await;
            server.emit(INSTRUCTION_RECEIVED, json!({"task_id": "other", "status": "ok"}));
            server.emit(
                INSTRUCTION_ERROR,
                json!({"task_id": "t1", "error": "task not running"}),
            );
            server.emit(INSTRUCTION_RECEIVED, json!({"task_id": "t1", "status": "ok"}));
        }
    });

    let err = session.send_instruction("shorter please").await.unwrap_err();
    match err {
        SessionError::Instruction(InstructionError::Rejected { message, .. }) => {
            assert_eq!(message, "task not running");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(session.messages().is_empty());

    // Only the session's own agent listeners remain bound
    tokio::task::yield_now().await;
    assert_eq!(client.connection().listeners().binding_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn instruction_times_out_after_thirty_seconds() {
    let (client, server) = client();
    let mut session = client.open_session("t1").await.unwrap();

    let started = tokio::time::Instant::now();
    let err = session.send_instruction("anyone there?").await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::Instruction(InstructionError::Timeout { .. })
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
    let sent = server.expect_emit(SEND_INSTRUCTION).await.unwrap();
    assert_eq!(sent["instruction"], "anyone there?");
}

#[tokio::test(start_paused = true)]
async fn session_keeps_streaming_after_server_drop() {
    let (client, server) = client();
    let mut session = client.open_session("t1").await.unwrap();
    let mut supervisor = client.watch_supervisor().unwrap();

    server.close(DisconnectReason::ServerInitiated);
    supervisor
        .wait_for(|s| matches!(s, ReconnectState::Reconnecting { .. }))
        .await
        .unwrap();
    supervisor
        .wait_for(|s| *s == ReconnectState::Connected)
        .await
        .unwrap();

    assert_eq!(server.connect_count(), 2);
    assert!(client.rooms().is_joined(session.task_id()));

    server.emit(AGENT_THOUGHT, json!({"type": "token", "token": "still here"}));
    pump(&mut session, 1).await;
    assert_eq!(session.buffer(StreamKind::Thought).content(), "still here");
}
