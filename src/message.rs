// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codec
//!
//! Turns raw deliveries into HTTP-shaped requests and bodies back into bytes.
//!
//! A delivery is decoded twice over: the `Request` handed to the handler (with defaults
//! filled in) and the `RawEnvelope`, the decoded document exactly as it arrived. Failure
//! paths republish the envelope so the original content survives, only gaining the
//! `response` field and the redelivery counter.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Method reported for every queue request.
pub const METHOD_NAME: &str = "QUEUE";
/// Field wrapping a body that is not a JSON object.
pub const QUEUE_MESSAGE_FIELD: &str = "queueMessage";
/// Redelivery counter kept in the envelope headers.
pub const TIMES_RESENT_HEADER: &str = "X-TimesResent";
/// Trace identifier header.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Failure context added to dead-lettered envelopes.
pub const RESPONSE_FIELD: &str = "response";

const PAYLOAD_FIELD: &str = "payload";
const HEADERS_FIELD: &str = "headers";
const QUERY_FIELD: &str = "query";
const PARAMS_FIELD: &str = "params";

/// HTTP-shaped view of a delivery handed to route handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub payload: Value,
    pub headers: Map<String, Value>,
    pub query: Value,
    pub params: Value,
    /// Body text when the delivery was not a JSON object.
    pub queue_message: Option<String>,
    /// Remaining top-level fields of the decoded document.
    pub extensions: Map<String, Value>,
    pub method: &'static str,
    pub path: String,
    pub received_at: DateTime<Utc>,
}

impl Request {
    /// String value of a header, if present and textual.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.header(TRACE_ID_HEADER)
    }
}

/// The decoded document as received, before any defaulting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEnvelope(Map<String, Value>);

impl RawEnvelope {
    pub fn new(fields: Map<String, Value>) -> RawEnvelope {
        RawEnvelope(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn headers(&self) -> Option<&Map<String, Value>> {
        self.0.get(HEADERS_FIELD).and_then(Value::as_object)
    }

    pub fn response(&self) -> Option<&Value> {
        self.0.get(RESPONSE_FIELD)
    }

    /// Attaches the failure context sent along with a dead-lettered envelope.
    pub fn set_response(&mut self, response: Value) {
        self.0.insert(RESPONSE_FIELD.to_owned(), response);
    }

    /// Current redelivery counter, when one is set and numeric.
    pub fn times_resent(&self) -> Option<u64> {
        self.headers()
            .and_then(|headers| headers.get(TIMES_RESENT_HEADER))
            .and_then(counter_value)
    }

    /// Increments the redelivery counter, initializing it to 0 when absent or not numeric.
    pub fn bump_times_resent(&mut self) -> u64 {
        let next = self.times_resent().map_or(0, |count| count + 1);

        let headers = self
            .0
            .entry(HEADERS_FIELD.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !headers.is_object() {
            *headers = Value::Object(Map::new());
        }
        if let Value::Object(headers) = headers {
            headers.insert(TIMES_RESENT_HEADER.to_owned(), Value::from(next));
        }

        next
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn counter_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Outbound message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Objects, arrays and null are serialized as JSON; strings, numbers and booleans are
    /// sent as their literal text.
    Json(Value),
    Raw(Vec<u8>),
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Json(Value::String(value.to_owned()))
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Json(Value::String(value))
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Raw(value)
    }
}

impl From<RawEnvelope> for Body {
    fn from(value: RawEnvelope) -> Self {
        Body::Json(value.into_value())
    }
}

impl From<HttpMessage> for Body {
    fn from(value: HttpMessage) -> Self {
        Body::Json(value.into_value())
    }
}

/// HTTP-shaped message published with `publish_http_to_topic`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpMessage {
    pub payload: Option<Value>,
    pub headers: Option<Map<String, Value>>,
    pub query: Option<Value>,
    pub params: Option<Value>,
}

impl HttpMessage {
    /// Creates a message carrying `payload`; the other sections stay unset.
    pub fn new(payload: Value) -> HttpMessage {
        HttpMessage {
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// Adds a header.
    ///
    /// # Parameters
    /// * `key` - Header name, e.g. `x-trace-id` or `x-flowinformtopic`
    /// * `value` - Any JSON value; strings are what handlers read back with `Request::header`
    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers
            .get_or_insert_with(Map::new)
            .insert(key.to_owned(), value.into());
        self
    }

    /// Sets the query section handed to the handler as `Request::query`.
    pub fn query(mut self, query: Value) -> Self {
        self.query = Some(query);
        self
    }

    /// Sets the params section handed to the handler as `Request::params`.
    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Document with every section present, missing ones as empty objects.
    pub fn into_value(self) -> Value {
        json!({
            HEADERS_FIELD: self.headers.map(Value::Object).unwrap_or_else(empty),
            PAYLOAD_FIELD: self.payload.unwrap_or_else(empty),
            QUERY_FIELD: self.query.unwrap_or_else(empty),
            PARAMS_FIELD: self.params.unwrap_or_else(empty),
        })
    }
}

fn empty() -> Value {
    Value::Object(Map::new())
}

/// Decodes delivery bytes into the handler request and the untouched envelope.
///
/// Bodies that are not a JSON object are wrapped under `queueMessage` instead of failing.
pub fn decode(topic: &str, method: &'static str, data: &[u8]) -> (Request, RawEnvelope) {
    let document = match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(fields)) => fields,
        _ => {
            let mut fields = Map::new();
            fields.insert(
                QUEUE_MESSAGE_FIELD.to_owned(),
                Value::String(String::from_utf8_lossy(data).into_owned()),
            );
            fields
        }
    };

    let raw = RawEnvelope(document.clone());

    let mut extensions = document;
    let payload = take_or_empty(&mut extensions, PAYLOAD_FIELD);
    let headers = match extensions.remove(HEADERS_FIELD) {
        Some(Value::Object(headers)) => headers,
        _ => Map::new(),
    };
    let query = take_or_empty(&mut extensions, QUERY_FIELD);
    let params = take_or_empty(&mut extensions, PARAMS_FIELD);
    let queue_message = match extensions.remove(QUEUE_MESSAGE_FIELD) {
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
        None => None,
    };

    let request = Request {
        payload,
        headers,
        query,
        params,
        queue_message,
        extensions,
        method,
        path: topic.to_owned(),
        received_at: Utc::now(),
    };

    (request, raw)
}

fn take_or_empty(fields: &mut Map<String, Value>, key: &str) -> Value {
    match fields.remove(key) {
        None | Some(Value::Null) => empty(),
        Some(value) => value,
    }
}

/// Whether the bytes decode as a JSON object.
pub fn is_structured(data: &[u8]) -> bool {
    matches!(serde_json::from_slice::<Value>(data), Ok(Value::Object(_)))
}

/// Encodes a body into publishable bytes. Never fails.
pub fn encode(body: &Body) -> Vec<u8> {
    match body {
        Body::Raw(bytes) => bytes.clone(),
        Body::Json(Value::String(text)) => text.as_bytes().to_vec(),
        Body::Json(value @ (Value::Number(_) | Value::Bool(_))) => value.to_string().into_bytes(),
        Body::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fills_request_defaults() {
        let (request, raw) = decode(
            "orders.created",
            METHOD_NAME,
            br#"{"payload":{"name":"Williams"},"origin":"web"}"#,
        );

        assert_eq!(request.payload, json!({"name": "Williams"}));
        assert!(request.headers.is_empty());
        assert_eq!(request.query, json!({}));
        assert_eq!(request.params, json!({}));
        assert_eq!(request.method, "QUEUE");
        assert_eq!(request.path, "orders.created");
        assert_eq!(request.queue_message, None);
        assert_eq!(request.extensions.get("origin"), Some(&json!("web")));

        assert_eq!(raw.headers(), None);
        assert_eq!(raw.get("origin"), Some(&json!("web")));
    }

    #[test]
    fn decode_wraps_non_json_bodies() {
        let (request, raw) = decode("greetings", METHOD_NAME, b"hello");

        assert_eq!(request.queue_message.as_deref(), Some("hello"));
        assert_eq!(request.payload, json!({}));
        assert!(request.headers.is_empty());
        assert_eq!(raw.get(QUEUE_MESSAGE_FIELD), Some(&json!("hello")));
    }

    #[test]
    fn decode_wraps_json_scalars() {
        let (request, _) = decode("numbers", METHOD_NAME, b"42");
        assert_eq!(request.queue_message.as_deref(), Some("42"));
        assert!(!is_structured(b"42"));
        assert!(is_structured(b"{}"));
    }

    #[test]
    fn encode_reproduces_decoded_json_objects() {
        let input = br#"{"payload":{"name":"Williams","tags":[1,2]},"headers":{"x-trace-id":"t-1"},"zeta":null}"#;
        let (_, raw) = decode("orders", METHOD_NAME, input);

        assert_eq!(encode(&Body::from(raw)), input.to_vec());
    }

    #[test]
    fn encode_passes_literals_through() {
        assert_eq!(encode(&Body::from("hello")), b"hello".to_vec());
        assert_eq!(encode(&Body::Json(json!(12))), b"12".to_vec());
        assert_eq!(encode(&Body::Raw(vec![0, 159])), vec![0, 159]);
        assert_eq!(encode(&Body::Json(json!({"a": 1}))), br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn times_resent_counts_from_zero() {
        let (_, mut raw) = decode("orders", METHOD_NAME, br#"{"payload":{}}"#);
        assert_eq!(raw.times_resent(), None);

        assert_eq!(raw.bump_times_resent(), 0);
        assert_eq!(raw.bump_times_resent(), 1);
        assert_eq!(raw.bump_times_resent(), 2);
        assert_eq!(raw.headers().unwrap().get(TIMES_RESENT_HEADER), Some(&json!(2)));
    }

    #[test]
    fn times_resent_accepts_numeric_strings_and_resets_garbage() {
        let (_, mut raw) = decode(
            "orders",
            METHOD_NAME,
            br#"{"headers":{"X-TimesResent":"3"}}"#,
        );
        assert_eq!(raw.bump_times_resent(), 4);

        let (_, mut raw) = decode("orders", METHOD_NAME, br#"{"headers":"oops"}"#);
        assert_eq!(raw.bump_times_resent(), 0);
        assert_eq!(raw.times_resent(), Some(0));
    }

    #[test]
    fn http_message_fills_every_section() {
        let body = HttpMessage::new(json!({"email": "a@b.c"}))
            .header(TRACE_ID_HEADER, "t-1")
            .into_value();

        assert_eq!(
            body,
            json!({
                "headers": {"x-trace-id": "t-1"},
                "payload": {"email": "a@b.c"},
                "query": {},
                "params": {},
            })
        );
    }
}
