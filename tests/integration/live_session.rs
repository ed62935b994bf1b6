//! End-to-end: step stream → router → playback queue → avatar driver.

use std::sync::Arc;
use std::time::Duration;

use encore::channel::ConnectionState;
use encore::playback::SilentSink;
use encore::step::Cue;
use encore::LiveSession;

use crate::helpers::{
    AvatarCall, ConnPlan, RecordingDriver, ScriptedDecoder, StepServer, WAIT, config_for,
    step_frame, wait_for_state,
};

fn cue_frame(index: u64, cue: &str, speech: &str, audio: &str) -> String {
    serde_json::json!({
        "type": "step",
        "step": index,
        "cue": cue,
        "speech": speech,
        "audio_b64": audio,
    })
    .to_string()
}

async fn wait_until_idle(driver: &RecordingDriver) {
    tokio::time::timeout(WAIT, async {
        while driver.calls().last() != Some(&AvatarCall::Speaking(false)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("performance never went idle");
}

#[tokio::test]
async fn performs_steps_with_dedup_and_captions() {
    let server = StepServer::start(vec![ConnPlan::open(vec![
        cue_frame(1, "wave", "hello", "a:10:200"),
        cue_frame(1, "wave", "hello", "a:10:200"),
        step_frame(2, Some("no audio here"), None),
        step_frame(3, Some("bye"), Some("c:10:100")),
    ])])
    .await;
    let mut config = config_for(&server);
    config.avatar.character_name = "Rin".into();

    let decoder = Arc::new(ScriptedDecoder::default());
    let driver = Arc::new(RecordingDriver::default());
    let session = LiveSession::start(
        &config,
        decoder.clone(),
        Box::new(SilentSink::new()),
        driver.clone(),
    )
    .unwrap();

    wait_until_idle(&driver).await;

    // The replayed frame never reaches the router: one decode, one cue.
    assert_eq!(decoder.started(), vec!["a", "c"]);
    let cues: Vec<_> = driver
        .calls()
        .into_iter()
        .filter(|c| matches!(c, AvatarCall::Cue(_)))
        .collect();
    assert_eq!(cues, vec![AvatarCall::Cue(Cue::tag("wave"))]);

    let captions = driver.captions();
    assert_eq!(captions.len(), 3);
    assert!(captions.contains(&("Rin: hello".into(), Some(Duration::from_millis(200)))));
    assert!(captions.contains(&("Rin: no audio here".into(), None)));
    assert!(captions.contains(&("Rin: bye".into(), Some(Duration::from_millis(100)))));

    // Timed captions arrive in playback order.
    let timed: Vec<_> = captions.iter().filter(|(_, d)| d.is_some()).collect();
    assert_eq!(timed[0].0, "Rin: hello");
    assert_eq!(timed[1].0, "Rin: bye");

    assert_eq!(driver.calls().first(), Some(&AvatarCall::Cue(Cue::tag("wave"))));
    assert!(driver.calls().contains(&AvatarCall::Speaking(true)));

    session.shutdown().await;
}

#[tokio::test]
async fn same_index_steps_without_audio_apply_every_cue() {
    let server = StepServer::start(vec![ConnPlan::open(vec![
        cue_frame(3, "smile", "first", ""),
        cue_frame(3, "wave", "second", ""),
    ])])
    .await;
    let config = config_for(&server);
    let driver = Arc::new(RecordingDriver::default());
    let session = LiveSession::start(
        &config,
        Arc::new(ScriptedDecoder::default()),
        Box::new(SilentSink::new()),
        driver.clone(),
    )
    .unwrap();

    let cue_count = |driver: &RecordingDriver| {
        driver
            .calls()
            .iter()
            .filter(|c| matches!(c, AvatarCall::Cue(_)))
            .count()
    };
    tokio::time::timeout(WAIT, async {
        while cue_count(&driver) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both steps should reach the avatar");

    let calls = driver.calls();
    assert!(calls.contains(&AvatarCall::Cue(Cue::tag("smile"))));
    assert!(calls.contains(&AvatarCall::Cue(Cue::tag("wave"))));
    // The second step shares the first one's key, so only its cue is applied.
    assert_eq!(driver.captions(), vec![("first".to_owned(), None)]);

    session.shutdown().await;
}

#[tokio::test]
async fn undecodable_audio_still_shows_caption() {
    let server = StepServer::start(vec![ConnPlan::open(vec![step_frame(
        1,
        Some("glitch"),
        Some("x:5:fail"),
    )])])
    .await;
    let config = config_for(&server);
    let driver = Arc::new(RecordingDriver::default());
    let session = LiveSession::start(
        &config,
        Arc::new(ScriptedDecoder::default()),
        Box::new(SilentSink::new()),
        driver.clone(),
    )
    .unwrap();

    wait_until_idle(&driver).await;
    assert_eq!(driver.captions(), vec![("glitch".to_owned(), None)]);
    assert!(!driver.calls().contains(&AvatarCall::Speaking(true)));

    session.shutdown().await;
}

#[tokio::test]
async fn shutdown_disconnects_and_silences() {
    let server = StepServer::start(vec![ConnPlan::open(vec![step_frame(
        1,
        Some("a long line"),
        Some("long:0:60000"),
    )])])
    .await;
    let config = config_for(&server);
    let driver = Arc::new(RecordingDriver::default());
    let session = LiveSession::start(
        &config,
        Arc::new(ScriptedDecoder::default()),
        Box::new(SilentSink::new()),
        driver.clone(),
    )
    .unwrap();

    let mut snapshot = session.channel().watch();
    wait_for_state(&mut snapshot, ConnectionState::Connected).await;
    tokio::time::timeout(WAIT, async {
        while !driver.calls().contains(&AvatarCall::Speaking(true)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("playback never started");

    let mut status = session.queue().status();
    session.shutdown().await;

    assert!(!status.borrow_and_update().busy);
    assert_eq!(snapshot.borrow().state, ConnectionState::Disconnected);
    assert_eq!(driver.calls().last(), Some(&AvatarCall::Speaking(false)));
}
