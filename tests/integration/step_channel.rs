//! Step channel against a real local WebSocket server.

use std::time::Duration;

use encore::channel::{ChannelEvent, ConnectionState, StepChannel};
use encore::LiveError;

use crate::helpers::{
    ConnPlan, StepServer, WAIT, fast_reconnect, next_step, step_frame, wait_for_state,
};

fn channel_for(server: &StepServer) -> StepChannel {
    StepChannel::new(server.ws_url(), fast_reconnect())
}

#[tokio::test]
async fn delivers_steps_once_connected() {
    let server = StepServer::start(vec![ConnPlan::open(vec![step_frame(
        1,
        Some("hello"),
        Some("QUFBQQ=="),
    )])])
    .await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();
    let mut snapshot = channel.watch();

    channel.connect();
    let step = next_step(&mut events).await;
    wait_for_state(&mut snapshot, ConnectionState::Connected).await;

    assert_eq!(step.index, 1);
    assert_eq!(step.speech.as_deref(), Some("hello"));
    assert_eq!(step.audio.as_ref().map(|a| a.as_str()), Some("QUFBQQ=="));

    let latest = channel.latest_step().unwrap();
    assert!(!latest.stale);
    assert_eq!(latest.step.index, 1);
}

#[tokio::test]
async fn reconnects_after_consecutive_failures() {
    let server = StepServer::start(vec![
        ConnPlan::Refuse,
        ConnPlan::Refuse,
        ConnPlan::Refuse,
        ConnPlan::open(vec![step_frame(7, None, None)]),
    ])
    .await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();
    let mut snapshot = channel.watch();

    channel.connect();
    let step = next_step(&mut events).await;
    wait_for_state(&mut snapshot, ConnectionState::Connected).await;

    assert_eq!(step.index, 7);
    assert_eq!(server.accepted(), 4);
    assert_eq!(channel.snapshot().reconnect_attempt, 0);
}

#[tokio::test]
async fn replayed_steps_are_not_redelivered_after_reconnect() {
    let server = StepServer::start(vec![
        ConnPlan::then_close(vec![
            step_frame(1, Some("one"), Some("QUFB")),
            step_frame(2, Some("two"), Some("QkJC")),
        ]),
        ConnPlan::open(vec![
            step_frame(1, Some("one"), Some("QUFB")),
            step_frame(2, Some("two"), Some("QkJC")),
            step_frame(3, Some("three"), Some("Q0ND")),
        ]),
    ])
    .await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();

    channel.connect();
    let mut indices = Vec::new();
    while indices.last() != Some(&3) {
        indices.push(next_step(&mut events).await.index);
    }

    assert_eq!(indices, vec![1, 2, 3]);
    assert!(server.accepted() >= 2);
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    let server = StepServer::start(vec![ConnPlan::open(vec![
        "this is not json".into(),
        r#"{"type":"mystery"}"#.into(),
        r#"{"type":"step","speech":"no index"}"#.into(),
        step_frame(4, None, None),
    ])])
    .await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();

    channel.connect();
    assert_eq!(next_step(&mut events).await.index, 4);
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn every_subscriber_sees_every_step() {
    let server = StepServer::start(vec![ConnPlan::open(vec![
        step_frame(1, None, None),
        step_frame(2, None, None),
    ])])
    .await;
    let channel = channel_for(&server);
    let mut first = channel.subscribe();
    let mut second = channel.subscribe();

    channel.connect();
    for rx in [&mut first, &mut second] {
        assert_eq!(next_step(rx).await.index, 1);
        assert_eq!(next_step(rx).await.index, 2);
    }
}

#[tokio::test]
async fn connect_is_idempotent() {
    let server = StepServer::start(Vec::new()).await;
    let channel = channel_for(&server);
    let mut snapshot = channel.watch();

    channel.connect();
    channel.connect();
    wait_for_state(&mut snapshot, ConnectionState::Connected).await;
    channel.connect();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn disconnect_stops_retrying_and_marks_step_stale() {
    let server = StepServer::start(vec![ConnPlan::open(vec![step_frame(9, None, None)])]).await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();

    channel.connect();
    next_step(&mut events).await;
    channel.disconnect();

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    let latest = channel.latest_step().unwrap();
    assert!(latest.stale);
    assert_eq!(latest.step.index, 9);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn keeps_retrying_while_backend_is_down() {
    let server = StepServer::start(vec![ConnPlan::Refuse; 50]).await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();

    channel.connect();
    tokio::time::timeout(WAIT, async {
        while server.accepted() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel stopped retrying");

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ChannelEvent::State(state) = event {
            states.push(state);
        }
    }
    assert!(!states.contains(&ConnectionState::Connected));
    assert!(states.contains(&ConnectionState::Disconnected));
    assert!(channel.snapshot().reconnect_attempt >= 1);

    channel.shutdown().await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn danmaku_is_sent_only_while_connected() {
    let mut server = StepServer::start(Vec::new()).await;
    let channel = channel_for(&server);
    let mut snapshot = channel.watch();

    assert!(matches!(
        channel.send_danmaku("too early", None),
        Err(LiveError::NotConnected)
    ));

    channel.connect();
    wait_for_state(&mut snapshot, ConnectionState::Connected).await;
    channel.send_danmaku("hello!", Some("kai")).unwrap();

    let frame = tokio::time::timeout(WAIT, server.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(json["type"], "danmaku");
    assert_eq!(json["text"], "hello!");
    assert_eq!(json["user"], "kai");

    channel.shutdown().await;
}

#[tokio::test]
async fn backend_messages_update_snapshot() {
    let server = StepServer::start(vec![ConnPlan::open(vec![
        r#"{"type":"info","content":"正在初始化..."}"#.into(),
        r#"{"type":"script_ready","total_steps":2,"script_preview":["Hook","Build"]}"#.into(),
        r#"{"type":"user_count","count":5}"#.into(),
        r#"{"type":"danmaku","text":"first!","user":"lin"}"#.into(),
        step_frame(1, Some("hi all"), None),
    ])])
    .await;
    let channel = channel_for(&server);
    let mut events = channel.subscribe();

    channel.connect();
    next_step(&mut events).await;

    let snap = channel.snapshot();
    assert_eq!(snap.phase, encore::StreamPhase::Performing);
    assert_eq!(snap.total_steps, 2);
    assert_eq!(snap.script_preview, vec!["Hook", "Build"]);
    assert_eq!(snap.online_count, 5);
    assert_eq!(snap.chat.len(), 2);
    assert!(!snap.chat[0].is_ai);
    assert!(snap.chat[1].is_ai);
}
