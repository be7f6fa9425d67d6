// Router and socket tests for the actor API

use super::*;
use crate::api::client::ActorClient;
use crate::api::tokens::TokenService;
use crate::engine::diff::SnapshotMirror;
use crate::engine::host::HostConfig;
use crate::engine::machine::{MachineDefinition, Transition};
use crate::engine::schema::Schema;
use crate::models::{Caller, CallerType, StateNode, CONNECT_EVENT, DISCONNECT_EVENT};
use axum::{
    body::Body,
    http::{header, Method, Request},
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tower::ServiceExt;

const SECRET: &str = "api-test-secret";

fn counter() -> MachineDefinition {
    MachineDefinition::builder(
        "counter",
        StateNode::compound("counting", [("counting", StateNode::atomic())]),
    )
    .context(|input| {
        json!({
            "count": input.get("start").cloned().unwrap_or(json!(0)),
            "online": 0
        })
    })
    .events(
        Schema::new(json!({
            "type": "object",
            "required": ["type"],
            "properties": {
                "type": {"enum": ["inc"]},
                "by": {"type": "integer"}
            }
        }))
        .unwrap(),
    )
    .on(
        "inc",
        Transition::new().action(|scope| {
            let by = scope.event.get("by").and_then(Value::as_i64).unwrap_or(1);
            let count = scope.context["count"].as_i64().unwrap_or(0);
            scope.context["count"] = json!(count + by);
            Ok(())
        }),
    )
    .on(
        CONNECT_EVENT,
        Transition::new().action(|scope| {
            let online = scope.context["online"].as_i64().unwrap_or(0);
            scope.context["online"] = json!(online + 1);
            Ok(())
        }),
    )
    .on(
        DISCONNECT_EVENT,
        Transition::new().action(|scope| {
            let online = scope.context["online"].as_i64().unwrap_or(0);
            scope.context["online"] = json!((online - 1).max(0));
            Ok(())
        }),
    )
    .build()
}

fn hub() -> Arc<ActorHub> {
    let config = HostConfig {
        ready_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    Arc::new(ActorHub::new(TokenService::new(SECRET), config).register(counter(), None))
}

fn bearer(room: &str) -> String {
    let token = TokenService::new(SECRET)
        .create_access_token(room, "alice", CallerType::User, "counter")
        .unwrap();
    format!("Bearer {}", token)
}

async fn json_body(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_router(hub());

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["actorTypes"], json!(["counter"]));
}

#[tokio::test]
async fn test_fetch_requires_token() {
    let response = create_router(hub())
        .oneshot(
            Request::builder()
                .uri("/counter/c1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "unauthorized");
}

#[tokio::test]
async fn test_fetch_snapshot_with_input() {
    let input = urlencoding::encode(r#"{"start":5}"#).into_owned();
    let response = create_router(hub())
        .oneshot(
            Request::builder()
                .uri(format!("/counter/c1?input={}", input))
                .header(header::AUTHORIZATION, bearer("c1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["connectionId"].is_string());
    assert!(body["token"].is_string());
    assert_eq!(body["snapshot"]["context"]["count"], 5);
    assert_eq!(body["snapshot"]["value"], "counting");
}

#[tokio::test]
async fn test_fetch_rejects_bad_input_and_unknown_type() {
    let app = create_router(hub());

    let bad_input = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/counter/c1?input=%7Bnope")
                .header(header::AUTHORIZATION, bearer("c1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bad_input.status(), StatusCode::BAD_REQUEST);

    let unknown = app
        .oneshot(
            Request::builder()
                .uri("/nothing/c1")
                .header(header::AUTHORIZATION, bearer("c1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_event() {
    let hub = hub();
    let app = create_router(hub.clone());

    let post = |body: Value| {
        Request::builder()
            .method(Method::POST)
            .uri("/counter/c2")
            .header(header::AUTHORIZATION, bearer("c2"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let accepted = app.clone().oneshot(post(json!({"type": "inc", "by": 2}))).await.unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    assert_eq!(json_body(accepted).await, json!({"status": "ok"}));

    let rejected = app.clone().oneshot(post(json!({"type": "dec"}))).await.unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(rejected).await["code"], "invalid_event");

    let reserved = app.oneshot(post(json!({"type": "connect"}))).await.unwrap();
    assert_eq!(reserved.status(), StatusCode::BAD_REQUEST);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let snapshot = hub.host("counter", "c2").unwrap().snapshot().await.unwrap();
    assert_eq!(snapshot.context["count"], 2);
}

#[tokio::test]
async fn test_post_without_credentials_is_unauthorized() {
    let response = create_router(hub())
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/counter/c3")
                .body(Body::from(r#"{"type":"inc"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

async fn serve(hub: Arc<ActorHub>) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(hub);

    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });

    format!("http://{}/", addr)
}

fn client(base_url: &str, caller: &str) -> ActorClient {
    ActorClient::new(
        base_url,
        "counter",
        TokenService::new(SECRET),
        Caller::user(caller),
    )
    .unwrap()
}

#[tokio::test]
async fn test_socket_diffs_replay_onto_fetched_snapshot() {
    let hub = hub();
    let base_url = serve(hub.clone()).await;
    let alice = client(&base_url, "alice");

    let fetched = alice.get("room", &json!({"start": 1})).await.unwrap();
    let mut mirror = SnapshotMirror::new(fetched.snapshot.clone());
    let mut socket = alice.connect("room", &fetched.token).await.unwrap();

    // the connect event is the first change
    let diff = timeout(Duration::from_secs(2), socket.next_diff())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    mirror.apply(&diff).unwrap();
    assert_eq!(mirror.value()["context"]["online"], 1);

    alice.send("room", &json!({"type": "inc", "by": 3})).await.unwrap();
    let diff = timeout(Duration::from_secs(2), socket.next_diff())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    mirror.apply(&diff).unwrap();

    socket.send(&json!({"type": "inc"})).await.unwrap();
    let diff = timeout(Duration::from_secs(2), socket.next_diff())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    mirror.apply(&diff).unwrap();

    let server = hub.host("counter", "room").unwrap().snapshot().await.unwrap();
    assert_eq!(mirror.value(), &server.to_persisted().unwrap());
    assert_eq!(server.context["count"], 5);

    socket.close().await;
}

#[tokio::test]
async fn test_reused_connection_token_is_closed_silently() {
    let hub = hub();
    let base_url = serve(hub.clone()).await;
    let bob = client(&base_url, "bob");

    let fetched = bob.get("room", &Value::Null).await.unwrap();
    let mut first = bob.connect("room", &fetched.token).await.unwrap();
    // attached once its connect event comes back as a diff
    timeout(Duration::from_secs(2), first.next_diff())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut second = bob.connect("room", &fetched.token).await.unwrap();

    let next = timeout(Duration::from_secs(2), second.next_diff()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_client_maps_server_errors() {
    let base_url = serve(hub()).await;
    let eve = ActorClient::new(
        &base_url,
        "counter",
        TokenService::new("wrong-secret"),
        Caller::guest("eve"),
    )
    .unwrap();

    assert!(matches!(
        eve.get("room", &Value::Null).await,
        Err(LiveStateError::Unauthorized(_))
    ));
}
