//! End-to-end tests of the HTTP router through tower's `oneshot`.

#![cfg(feature = "http")]

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use rpcwire_transport::{
    HttpTransport, Message, MessageHandler, Transport, TransportConfig, TransportResult, keys,
};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(
        &self,
        message: Message,
        _transport: &dyn Transport,
    ) -> TransportResult<Option<Message>> {
        Ok(message
            .id
            .map(|id| Message::response(message.params.unwrap_or(Value::Null), id)))
    }
}

/// Declines everything but `echo`.
struct EchoOnly;

#[async_trait]
impl MessageHandler for EchoOnly {
    async fn handle(
        &self,
        message: Message,
        transport: &dyn Transport,
    ) -> TransportResult<Option<Message>> {
        Echo.handle(message, transport).await
    }

    fn can_handle(&self, message: &Message) -> bool {
        message.method.as_deref() == Some("echo")
    }
}

async fn app(config: TransportConfig) -> (Arc<HttpTransport>, Router) {
    let transport = Arc::new(HttpTransport::http());
    transport.initialize(config).unwrap();
    transport.set_message_handler(Arc::new(Echo));
    transport.start().await.unwrap();
    let router = transport.clone().router("/rpc");
    (transport, router)
}

fn post(content_type: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/rpc")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn request_round_trips_through_router() {
    let (transport, router) = app(TransportConfig::new()).await;

    let response = router
        .oneshot(post(
            "application/json",
            r#"{"jsonrpc":"2.0","method":"echo","params":{"v":[1,2]},"id":"abc"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body,
        json!({"jsonrpc": "2.0", "result": {"v": [1, 2]}, "id": "abc"})
    );

    let stats = transport.stats();
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.messages_sent, 1);
}

#[tokio::test]
async fn wrong_content_type_is_rejected() {
    let (_transport, router) = app(TransportConfig::new()).await;

    let response = router
        .oneshot(post(
            "text/plain",
            r#"{"jsonrpc":"2.0","method":"echo","id":1}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["error"]["message"], "Invalid Content-Type");
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn notification_gets_empty_204() {
    let (_transport, router) = app(TransportConfig::new()).await;

    let response = router
        .oneshot(post(
            "application/json",
            r#"{"jsonrpc":"2.0","method":"log","params":{"line":"x"}}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn declined_request_gets_method_not_found() {
    let (transport, _router) = app(TransportConfig::new()).await;
    transport.set_message_handler(Arc::new(EchoOnly));
    let router = transport.clone().router("/rpc");

    let response = router
        .clone()
        .oneshot(post(
            "application/json",
            r#"{"jsonrpc":"2.0","method":"admin","id":12}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["id"], 12);
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["error"]["data"]["method"], "admin");

    // a declined notification is still just acknowledged
    let response = router
        .oneshot(post(
            "application/json",
            r#"{"jsonrpc":"2.0","method":"admin"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn malformed_body_is_parse_error() {
    let (_transport, router) = app(TransportConfig::new()).await;

    let response = router
        .oneshot(post("application/json", "{not json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert!(body["error"]["data"]["reason"].is_string());
}

#[tokio::test]
async fn preflight_reflects_listed_origin() {
    let config =
        TransportConfig::new().with(keys::CORS_ALLOWED_ORIGINS, json!(["https://app.example"]));
    let (_transport, router) = app(config).await;

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/rpc")
        .header(header::ORIGIN, "https://app.example")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example"
    );
    assert_eq!(response.headers()[header::VARY], "origin");
    assert!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("POST")
    );

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/rpc")
        .header(header::ORIGIN, "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}

#[tokio::test]
async fn unknown_path_is_not_routed() {
    let (_transport, router) = app(TransportConfig::new()).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/other")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
