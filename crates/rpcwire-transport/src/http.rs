//! HTTP transport implementation.
//!
//! One HTTP exchange carries one JSON-RPC message: the request body is the
//! incoming message and the response body is the handler's reply. The socket
//! itself belongs to whichever server mounts [`HttpTransport::router`];
//! `start`/`stop` only toggle readiness so the lifecycle (and the handler's
//! `on_connect`/`on_disconnect`) matches the stdio transport.
//!
//! | Condition | Status | `error.code` |
//! |-----------|--------|--------------|
//! | `Content-Type` not `application/json` | 400 | -32700 |
//! | empty body or invalid JSON | 400 | -32700 |
//! | valid JSON, invalid envelope | 400 | -32600 |
//! | handler returns nothing | 204 | |
//! | handler returns a message | 200 | |
//! | handler fails, or reply cannot be encoded | 500 | -32603 |

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, error, trace, warn};

use rpcwire_traits::{
    Message, RequestId, Transport, TransportConfig, TransportError, TransportFactory,
    TransportResult, TransportType, error_codes, keys,
};

use crate::base::{BaseTransport, TransportBackend};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Body used if an error reply itself cannot be encoded.
const FALLBACK_ERROR_BODY: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;

/// CORS settings read from the transport config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows all
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    pub allowed_methods: Vec<String>,
    /// Allowed request headers
    pub allowed_headers: Vec<String>,
    /// Preflight cache lifetime in seconds
    pub max_age: u64,
}

impl CorsConfig {
    /// Reads the `cors_*` keys.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            allowed_origins: config
                .get_string_list(keys::CORS_ALLOWED_ORIGINS)
                .unwrap_or_else(|| vec!["*".to_string()]),
            allowed_methods: config
                .get_string_list(keys::CORS_ALLOWED_METHODS)
                .unwrap_or_else(|| vec!["POST".to_string(), "OPTIONS".to_string()]),
            allowed_headers: config
                .get_string_list(keys::CORS_ALLOWED_HEADERS)
                .unwrap_or_else(|| vec!["Content-Type".to_string(), "Authorization".to_string()]),
            max_age: config.get_u64(keys::CORS_MAX_AGE).unwrap_or(86400),
        }
    }

    /// The `Access-Control-Allow-Origin` value for a request from `origin`.
    ///
    /// `*` if all origins are allowed, the origin itself if listed, else `None`.
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }
        let origin = origin?;
        self.allowed_origins
            .iter()
            .any(|o| o == origin)
            .then(|| origin.to_string())
    }
}

/// HTTP half of [`HttpTransport`].
#[derive(Debug, Default)]
pub struct HttpBackend {
    outbox: Mutex<VecDeque<Message>>,
}

#[async_trait]
impl TransportBackend for HttpBackend {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    fn validate_config(&self, config: &TransportConfig) -> TransportResult<()> {
        match config.get_str(keys::SCHEME) {
            Some("http" | "https") | None => {}
            Some(other) => {
                return Err(TransportError::ConfigurationError(format!(
                    "scheme must be \"http\" or \"https\", got {other:?}"
                )));
            }
        }
        if let Some(port) = config.get(keys::PORT) {
            match port.as_u64() {
                Some(1..=65535) => {}
                _ => {
                    return Err(TransportError::ConfigurationError(format!(
                        "port must be an integer in 1..=65535, got {port}"
                    )));
                }
            }
        }
        if let Some(path) = config.get_str(keys::PATH)
            && !path.starts_with('/')
        {
            return Err(TransportError::ConfigurationError(format!(
                "path must start with '/', got {path:?}"
            )));
        }
        Ok(())
    }

    async fn do_start(&self, config: &TransportConfig) -> TransportResult<()> {
        debug!(url = %base_url(config), "http transport ready");
        Ok(())
    }

    async fn do_stop(&self) -> TransportResult<()> {
        let dropped = {
            let mut outbox = self.outbox.lock();
            let n = outbox.len();
            outbox.clear();
            n
        };
        if dropped > 0 {
            warn!(dropped, "discarding undelivered outbound messages");
        }
        Ok(())
    }

    async fn do_send(&self, message: &Message) -> TransportResult<()> {
        message.validate()?;
        self.outbox.lock().push_back(message.clone());
        Ok(())
    }

    async fn do_receive(&self) -> TransportResult<Option<Message>> {
        // requests arrive through handle_http_request
        Ok(None)
    }

    fn endpoint(&self, config: &TransportConfig) -> Option<String> {
        Some(base_url(config))
    }
}

/// Composes `scheme://host[:port]/path`, omitting the scheme's default port.
fn base_url(config: &TransportConfig) -> String {
    let scheme = config.get_str(keys::SCHEME).unwrap_or("http");
    let host = config.get_str(keys::HOST).unwrap_or("localhost");
    let path = config.get_str(keys::PATH).unwrap_or("/");
    let port = config.get_u64(keys::PORT);

    let default_port = match scheme {
        "https" => 443,
        _ => 80,
    };
    match port {
        Some(port) if port != default_port => format!("{scheme}://{host}:{port}{path}"),
        _ => format!("{scheme}://{host}{path}"),
    }
}

/// JSON-RPC over HTTP POST.
///
/// # Examples
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use rpcwire_transport::{HttpTransport, Transport};
///
/// let transport = Arc::new(HttpTransport::http());
/// transport.set_message_handler(Arc::new(MyHandler));
/// transport.start().await?;
///
/// let app = transport.clone().router("/rpc");
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
/// axum::serve(listener, app).await?;
/// ```
pub type HttpTransport = BaseTransport<HttpBackend>;

impl BaseTransport<HttpBackend> {
    /// A new, unstarted HTTP transport.
    pub fn http() -> Self {
        Self::new(HttpBackend::default())
    }

    /// `scheme://host[:port]/path` from the current config.
    pub fn base_url(&self) -> String {
        base_url(&self.config())
    }

    /// CORS settings from the current config.
    pub fn cors(&self) -> CorsConfig {
        CorsConfig::from_config(&self.config())
    }

    /// Processes one POSTed JSON-RPC message.
    pub async fn handle_http_request(&self, headers: &HeaderMap, body: Bytes) -> Response {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut response = self.process_post(headers, &body).await;
        self.apply_allow_origin(&mut response, origin.as_deref());
        response
    }

    /// CORS preflight reply.
    pub fn handle_options_request(&self, headers: &HeaderMap) -> Response {
        let cors = self.cors();
        let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());

        let mut response = StatusCode::NO_CONTENT.into_response();
        let out = response.headers_mut();
        if let Some(allowed) = cors.allow_origin(origin) {
            if allowed != "*" {
                out.insert(header::VARY, HeaderValue::from_static("origin"));
            }
            insert_header(out, header::ACCESS_CONTROL_ALLOW_ORIGIN, &allowed);
        }
        insert_header(
            out,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            &cors.allowed_methods.join(", "),
        );
        insert_header(
            out,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            &cors.allowed_headers.join(", "),
        );
        insert_header(
            out,
            header::ACCESS_CONTROL_MAX_AGE,
            &cors.max_age.to_string(),
        );
        response
    }

    /// Takes every message queued by `send`, oldest first.
    pub fn drain_outbound(&self) -> Vec<Message> {
        self.backend().outbox.lock().drain(..).collect()
    }

    /// An axum router serving `POST path` and `OPTIONS path`.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, post(post_handler).options(options_handler))
            .with_state(self)
    }

    async fn process_post(&self, headers: &HeaderMap, body: &Bytes) -> Response {
        if !has_json_content_type(headers) {
            return error_reply(
                StatusCode::BAD_REQUEST,
                error_codes::PARSE_ERROR,
                "Invalid Content-Type",
                None,
                RequestId::Null,
            );
        }

        if body.trim_ascii().is_empty() {
            return error_reply(
                StatusCode::BAD_REQUEST,
                error_codes::PARSE_ERROR,
                "Parse error",
                Some(json!({ "reason": "request body is empty" })),
                RequestId::Null,
            );
        }

        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "rejecting unparseable body");
                return error_reply(
                    StatusCode::BAD_REQUEST,
                    error_codes::PARSE_ERROR,
                    "Parse error",
                    Some(json!({ "reason": e.to_string() })),
                    RequestId::Null,
                );
            }
        };

        let id = value
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "rejecting invalid envelope");
                return error_reply(
                    StatusCode::BAD_REQUEST,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request",
                    Some(json!({ "reason": e.to_string() })),
                    id.unwrap_or(RequestId::Null),
                );
            }
        };

        if !self.is_connected() {
            return internal_error(
                &TransportError::ConnectionFailed("http transport is not started".to_string()),
                id,
            );
        }

        trace!(kind = message.kind(), "dispatching http message");
        match self.dispatch(message).await {
            Ok(None) => StatusCode::NO_CONTENT.into_response(),
            Ok(Some(reply)) => match serde_json::to_vec(&reply) {
                Ok(bytes) => {
                    self.record_sent(1);
                    json_response(StatusCode::OK, bytes)
                }
                Err(e) => {
                    error!(error = %e, "failed to encode reply");
                    self.record_error();
                    internal_error(&TransportError::from(e), id)
                }
            },
            Err(e) => internal_error(&e, id),
        }
    }

    fn apply_allow_origin(&self, response: &mut Response, origin: Option<&str>) {
        if let Some(allowed) = self.cors().allow_origin(origin) {
            insert_header(
                response.headers_mut(),
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                &allowed,
            );
        }
    }
}

async fn post_handler(
    State(transport): State<Arc<HttpTransport>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    transport.handle_http_request(&headers, body).await
}

async fn options_handler(
    State(transport): State<Arc<HttpTransport>>,
    headers: HeaderMap,
) -> Response {
    transport.handle_options_request(&headers)
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!(header = %name, error = %e, "skipping invalid header value"),
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE))],
        Body::from(body),
    )
        .into_response()
}

fn error_reply(
    status: StatusCode,
    code: i64,
    message: &str,
    data: Option<Value>,
    id: RequestId,
) -> Response {
    let reply = Message::error_response(code, message, data, id);
    let body = serde_json::to_vec(&reply).unwrap_or_else(|_| FALLBACK_ERROR_BODY.as_bytes().to_vec());
    json_response(status, body)
}

fn internal_error(error: &TransportError, id: Option<RequestId>) -> Response {
    error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::INTERNAL_ERROR,
        "Internal error",
        Some(json!({ "reason": error.to_string() })),
        id.unwrap_or(RequestId::Null),
    )
}

/// Creates HTTP transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    fn create(&self, config: TransportConfig) -> TransportResult<Box<dyn Transport>> {
        let transport = HttpTransport::http();
        transport.initialize(config)?;
        debug!(url = %transport.base_url(), "created http transport");
        Ok(Box::new(transport))
    }
}
