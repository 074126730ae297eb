//! JSON-RPC 2.0 message envelope.
//!
//! A [`Message`] is either a request (`method` + `id`), a notification
//! (`method`, no `id`) or a response (`result` or `error`). The distinction
//! between an absent field and an explicit `null` is preserved for `id`,
//! `params` and `result`, so `{"id": null}` and a missing `id` round-trip
//! differently.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::error::{TransportError, TransportResult};

/// The only protocol version accepted in the `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Generic implementation-defined server error.
    pub const SERVER_ERROR: i64 = -32000;
}

/// The standard error codes as a fixed name/code table.
pub const fn standard_error_codes() -> &'static [(&'static str, i64)] {
    &[
        ("PARSE_ERROR", error_codes::PARSE_ERROR),
        ("INVALID_REQUEST", error_codes::INVALID_REQUEST),
        ("METHOD_NOT_FOUND", error_codes::METHOD_NOT_FOUND),
        ("INVALID_PARAMS", error_codes::INVALID_PARAMS),
        ("INTERNAL_ERROR", error_codes::INTERNAL_ERROR),
        ("SERVER_ERROR", error_codes::SERVER_ERROR),
    ]
}

/// A JSON-RPC request identifier: string, number, or explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(Number),
    /// Explicit `null` identifier
    Null,
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Number(n) => n.serialize(serializer),
            Self::Null => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self::String(s)),
            Value::Number(n) => Ok(Self::Number(n)),
            Value::Null => Ok(Self::Null),
            other => Err(de::Error::custom(format!(
                "id must be a string, number, or null, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Integer error code
    pub code: i64,
    /// Short human-readable description
    pub message: String,
    /// Optional structured detail
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Creates an error object without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version, must be `"2.0"`
    pub jsonrpc: String,

    /// Method name (requests and notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Method parameters, an array or object when present
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub params: Option<Value>,

    /// Request identifier; absent for notifications
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub id: Option<RequestId>,

    /// Successful result (responses only)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,

    /// Error result (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Maps a present field to `Some`, including an explicit `null`.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl Message {
    /// Creates a request.
    pub fn request(method: impl Into<String>, params: Option<Value>, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.into()),
            params,
            id: Some(id.into()),
            result: None,
            error: None,
        }
    }

    /// Creates a notification (a request without an `id`).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.into()),
            params,
            id: None,
            result: None,
            error: None,
        }
    }

    /// Creates a successful response.
    pub fn response(result: Value, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: None,
            params: None,
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    ///
    /// `id` is `RequestId::Null` when the request id could not be determined.
    pub fn error_response(
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
        id: impl Into<RequestId>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: None,
            params: None,
            id: Some(id.into()),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// `method` and `id` present.
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    /// `method` present, `id` absent.
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// `result` or `error` present and no `method`.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// The message kind as used by [`MessageHandler::supported_message_types`](crate::MessageHandler::supported_message_types).
    pub fn kind(&self) -> &'static str {
        if self.is_request() {
            "request"
        } else if self.is_notification() {
            "notification"
        } else if self.is_response() {
            "response"
        } else {
            "invalid"
        }
    }

    /// Checks the structural invariants of the envelope.
    ///
    /// Never coerces: a violation is always reported as a
    /// [`TransportError::ProtocolError`].
    pub fn validate(&self) -> TransportResult<()> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(protocol(format!(
                "jsonrpc must be \"2.0\", got {:?}",
                self.jsonrpc
            )));
        }
        check_shape(
            self.method.is_some(),
            self.result.is_some(),
            self.error.is_some(),
        )?;
        if let Some(params) = &self.params {
            check_params(params)?;
        }
        Ok(())
    }

    /// Validates a raw JSON value and converts it into a message.
    pub fn from_value(value: Value) -> TransportResult<Self> {
        validate_envelope(&value)?;
        serde_json::from_value(value).map_err(|e| protocol(e.to_string()))
    }

    /// Decodes and validates a message from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> TransportResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Encodes the message as compact JSON.
    pub fn to_vec(&self) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Validates an untyped JSON value against the JSON-RPC 2.0 envelope rules.
///
/// Checks: `jsonrpc == "2.0"`; exactly one of `method` or `result`/`error`;
/// `result` and `error` mutually exclusive; `method` is a string; `params`
/// is an array or object; `id` is a string, number or null; `error.code` is
/// an integer and `error.message` a string.
pub fn validate_envelope(value: &Value) -> TransportResult<()> {
    let object = value.as_object().ok_or_else(|| {
        protocol(format!(
            "message must be a JSON object, got {}",
            json_type_name(value)
        ))
    })?;

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(protocol(format!("jsonrpc must be \"2.0\", got {other}"))),
        None => return Err(protocol("missing jsonrpc field")),
    }

    let method = object.get("method");
    check_shape(
        method.is_some(),
        object.contains_key("result"),
        object.contains_key("error"),
    )?;

    if let Some(method) = method
        && !method.is_string()
    {
        return Err(protocol(format!(
            "method must be a string, got {}",
            json_type_name(method)
        )));
    }

    if let Some(params) = object.get("params") {
        check_params(params)?;
    }

    if let Some(id) = object.get("id")
        && !matches!(id, Value::String(_) | Value::Number(_) | Value::Null)
    {
        return Err(protocol(format!(
            "id must be a string, number, or null, got {}",
            json_type_name(id)
        )));
    }

    if let Some(error) = object.get("error") {
        let error = error
            .as_object()
            .ok_or_else(|| protocol("error must be an object"))?;
        match error.get("code") {
            Some(code) if code.is_i64() || code.is_u64() => {}
            _ => return Err(protocol("error.code must be an integer")),
        }
        match error.get("message") {
            Some(Value::String(_)) => {}
            _ => return Err(protocol("error.message must be a string")),
        }
    }

    Ok(())
}

fn check_shape(has_method: bool, has_result: bool, has_error: bool) -> TransportResult<()> {
    if has_result && has_error {
        return Err(protocol("response cannot contain both result and error"));
    }
    match (has_method, has_result || has_error) {
        (true, true) => Err(protocol(
            "message cannot be both a request and a response",
        )),
        (false, false) => Err(protocol(
            "message must contain either method or result/error",
        )),
        _ => Ok(()),
    }
}

fn check_params(params: &Value) -> TransportResult<()> {
    if params.is_array() || params.is_object() {
        Ok(())
    } else {
        Err(protocol(format!(
            "params must be an array or object, got {}",
            json_type_name(params)
        )))
    }
}

fn protocol(message: impl Into<String>) -> TransportError {
    TransportError::ProtocolError(message.into())
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn id() -> impl Strategy<Value = RequestId> {
        prop_oneof![
            any::<i64>().prop_map(RequestId::from),
            "[a-z0-9-]{1,12}".prop_map(RequestId::from),
        ]
    }

    fn params() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            prop::collection::vec(any::<i32>(), 0..4).prop_map(|v| Some(json!(v))),
            ("[a-z]{1,8}", any::<bool>()).prop_map(|(k, b)| Some(json!({ k: b }))),
        ]
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            ("[a-z/]{1,16}", params(), id()).prop_map(|(m, p, id)| Message::request(m, p, id)),
            ("[a-z/]{1,16}", params()).prop_map(|(m, p)| Message::notification(m, p)),
            ("[ -~]{0,16}", id()).prop_map(|(s, id)| Message::response(json!(s), id)),
            (-32768i64..-32000, "[ -~]{1,16}", id())
                .prop_map(|(code, text, id)| Message::error_response(code, text, None, id)),
        ]
    }

    proptest! {
        /// Property: every constructor yields an envelope that validates in
        /// both typed and untyped form and survives a JSON round trip
        #[test]
        fn prop_constructed_messages_are_valid(msg in message()) {
            prop_assert!(msg.validate().is_ok());

            let value = serde_json::to_value(&msg).unwrap();
            prop_assert!(validate_envelope(&value).is_ok());
            prop_assert_eq!(Message::from_value(value).unwrap(), msg);
        }

        /// Property: a scalar `params` is always rejected
        #[test]
        fn prop_scalar_params_rejected(n in any::<i64>()) {
            let value = json!({ "jsonrpc": "2.0", "method": "m", "params": n });
            prop_assert!(
                matches!(validate_envelope(&value), Err(TransportError::ProtocolError(_))),
                "expected protocol error"
            );
        }
    }
}
