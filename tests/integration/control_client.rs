//! Control API client against a mock backend.

use encore::LiveError;
use encore::control::{
    AiSuggestRequest, ControlClient, Room, StartLiveRequest, SuggestContext, SuggestField,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client_for(server: &MockServer) -> ControlClient {
    ControlClient::new(server.uri()).unwrap()
}

fn room() -> Room {
    Room {
        room_id: "r-42".into(),
        owner_token: "secret".into(),
    }
}

#[tokio::test]
async fn health_reflects_docs_endpoint() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;
    assert!(!client.health().await);

    Mock::given(method("HEAD"))
        .and(path("/docs"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    assert!(client.health().await);
}

#[tokio::test]
async fn creates_room_and_starts_live() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/room"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "room_id": "r-42", "owner_token": "secret" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/start"))
        .and(body_partial_json(json!({
            "room_id": "r-42",
            "owner_token": "secret",
            "character_name": "Rin",
            "topic": "space cats",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "started" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let created = client.create_room().await.unwrap();
    assert_eq!(created, room());

    let request = StartLiveRequest {
        character_name: "Rin".into(),
        persona: "cheerful".into(),
        topic: "space cats".into(),
        ..StartLiveRequest::default()
    };
    let reply = client.start_live(&request, &created).await.unwrap();
    assert_eq!(reply["status"], "started");
}

#[tokio::test]
async fn rejection_carries_backend_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/start"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({ "detail": "bad owner token" })),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .start_live(&StartLiveRequest::default(), &room())
        .await
        .unwrap_err();
    match err {
        LiveError::Http(msg) => {
            assert!(msg.contains("403"), "{msg}");
            assert!(msg.contains("bad owner token"), "{msg}");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn rejection_without_detail_uses_status_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/room"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client_for(&server).await.create_room().await.unwrap_err();
    assert!(err.to_string().contains("Internal Server Error"), "{err}");
}

#[tokio::test]
async fn online_count_reads_count_field() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/online-count"))
        .and(query_param("room_id", "r-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 12 })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/online-count"))
        .and(query_param("room_id", "empty"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert_eq!(client.online_count("r-42").await.unwrap(), 12);
    assert_eq!(client.online_count("empty").await.unwrap(), 0);
    assert_eq!(client.online_count("").await.unwrap(), 0);
}

#[tokio::test]
async fn room_exists_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .and(query_param("room_id", "r-42"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "running": true, "step": 3 })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .and(query_param("room_id", "gone"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "detail": "no such room" })),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(client.room_exists("r-42").await);
    assert!(!client.room_exists("gone").await);
    assert!(!client.room_exists("").await);

    let status = client.status("r-42").await.unwrap();
    assert_eq!(status["step"], 3);
    assert!(matches!(client.status("gone").await, Err(LiveError::Http(_))));
}

#[tokio::test]
async fn danmaku_defaults_user() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/danmaku"))
        .and(body_partial_json(json!({
            "room_id": "r-42",
            "text": "encore!",
            "user": "viewer",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client_for(&server)
        .await
        .send_danmaku("r-42", "encore!", None)
        .await
        .unwrap();
    assert_eq!(reply["ok"], true);
}

#[tokio::test]
async fn history_is_returned_raw() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "topic": "cats" }])))
        .mount(&server)
        .await;

    let history = client_for(&server).await.history().await.unwrap();
    assert_eq!(history[0]["topic"], "cats");
}

#[tokio::test]
async fn ai_suggest_returns_suggestion_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai-suggest"))
        .and(body_partial_json(json!({
            "field": "topic",
            "context": { "characterName": "Rin" },
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "suggestion": "A day on Mars" })),
        )
        .mount(&server)
        .await;

    let request = AiSuggestRequest {
        field: SuggestField::Topic,
        context: SuggestContext {
            character_name: Some("Rin".into()),
            ..SuggestContext::default()
        },
    };
    let text = client_for(&server).await.ai_suggest(&request).await.unwrap();
    assert_eq!(text, "A day on Mars");
}

#[tokio::test]
async fn unreachable_backend_is_an_http_error() {
    let client = ControlClient::new("http://127.0.0.1:9").unwrap();
    assert!(!client.health().await);
    assert!(matches!(client.create_room().await, Err(LiveError::Http(_))));
}
