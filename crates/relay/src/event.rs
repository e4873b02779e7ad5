//! The event envelope exchanged over lanes.
//!
//! An [`Event`] is immutable once handed to the bus. Every "mutating"
//! method consumes the event and returns a new value, and derived events
//! ([`Event::make_child`]) get a fresh id while the provenance `path` grows
//! by exactly one element.
//!
//! The logical type of the body travels in the `contentType` header; the
//! `payload_*` accessors reinterpret the raw bytes accordingly.

use crate::coerce;
use crate::error::{RelayError, Result};
use crate::value::Value;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

pub const REPLY_TO_HEADER: &str = "replyTo";
pub const CONTENT_TYPE_HEADER: &str = "contentType";
pub const STATUS_HEADER: &str = "status";
pub const FILE_PATH_HEADER: &str = "filePath";

/// Logical content type of an event body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Binary,
    Json,
    JsonArray,
    Xml,
    Xhtml,
    Html,
    Text,
    Int,
    Long,
    Bool,
}

impl ContentType {
    pub const ALL: [ContentType; 10] = [
        ContentType::Binary,
        ContentType::Json,
        ContentType::JsonArray,
        ContentType::Xml,
        ContentType::Xhtml,
        ContentType::Html,
        ContentType::Text,
        ContentType::Int,
        ContentType::Long,
        ContentType::Bool,
    ];

    pub fn media_type(self) -> &'static str {
        match self {
            ContentType::Binary => "application/octet-stream",
            ContentType::Json => "application/json",
            ContentType::JsonArray => "application/json+array",
            ContentType::Xml => "application/xml",
            ContentType::Xhtml => "application/xhtml",
            ContentType::Html => "text/html",
            ContentType::Text => "text/plain",
            ContentType::Int => "text/int",
            ContentType::Long => "text/long",
            ContentType::Bool => "text/boolean",
        }
    }

    /// Symbolic name used in stage documents (`JSON`, `TEXT`, ...).
    pub fn name(self) -> &'static str {
        match self {
            ContentType::Binary => "BINARY",
            ContentType::Json => "JSON",
            ContentType::JsonArray => "JSONA",
            ContentType::Xml => "XML",
            ContentType::Xhtml => "XHTML",
            ContentType::Html => "HTML",
            ContentType::Text => "TEXT",
            ContentType::Int => "INT",
            ContentType::Long => "LONG",
            ContentType::Bool => "BOOL",
        }
    }

    pub fn from_media_type(media_type: Option<&str>, default: ContentType) -> ContentType {
        media_type
            .and_then(|m| {
                Self::ALL
                    .into_iter()
                    .find(|ct| ct.media_type().eq_ignore_ascii_case(m))
            })
            .unwrap_or(default)
    }

    pub fn from_name(name: Option<&str>, default: ContentType) -> ContentType {
        name.and_then(|n| Self::ALL.into_iter().find(|ct| ct.name().eq_ignore_ascii_case(n)))
            .unwrap_or(default)
    }
}

/// HTTP-style status carried in the `status` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Created,
    Accepted,
    NoContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    Conflict,
    InternalServerError,
    ServiceUnavailable,
    GatewayTimeout,
}

impl Status {
    const ALL: [Status; 13] = [
        Status::Ok,
        Status::Created,
        Status::Accepted,
        Status::NoContent,
        Status::BadRequest,
        Status::Unauthorized,
        Status::Forbidden,
        Status::NotFound,
        Status::RequestTimeout,
        Status::Conflict,
        Status::InternalServerError,
        Status::ServiceUnavailable,
        Status::GatewayTimeout,
    ];

    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::Accepted => 202,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::RequestTimeout => 408,
            Status::Conflict => 409,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
            Status::GatewayTimeout => 504,
        }
    }

    pub fn from_code(code: Option<u16>, default: Status) -> Status {
        code.and_then(|c| Self::ALL.into_iter().find(|s| s.code() == c))
            .unwrap_or(default)
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.code())
    }
}

/// A body reinterpreted according to its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Bool(bool),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
}

/// Interprets `body` as `content_type`.
///
/// JSON types parse the whole body (an object for `Json`, an array for
/// `JsonArray`); bool/int/long parse the UTF-8 text, falling back to
/// `false`/`0`; text, XML and XHTML decode lossily; binary and HTML return
/// the raw bytes.
///
/// # Errors
///
/// Only malformed JSON bodies fail.
pub fn as_content_type(body: &Bytes, content_type: ContentType) -> Result<Payload> {
    let text = || String::from_utf8_lossy(body).into_owned();
    let payload = match content_type {
        ContentType::Json => {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            if !value.is_object() {
                return Err(RelayError::Decode("expected a JSON object body".into()));
            }
            Payload::Json(value)
        }
        ContentType::JsonArray => {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            if !value.is_array() {
                return Err(RelayError::Decode("expected a JSON array body".into()));
            }
            Payload::Json(value)
        }
        ContentType::Bool => Payload::Bool(coerce::as_bool(&Value::String(text())).unwrap_or(false)),
        ContentType::Int => Payload::Int(coerce::as_int(&Value::String(text())).unwrap_or(0)),
        ContentType::Long => Payload::Long(coerce::as_long(&Value::String(text())).unwrap_or(0)),
        ContentType::Text | ContentType::Xml | ContentType::Xhtml => Payload::Text(text()),
        ContentType::Binary | ContentType::Html => Payload::Bytes(body.clone()),
    };
    Ok(payload)
}

/// The message unit flowing through the bus.
///
/// Equality and hashing consider only the id.
#[derive(Clone)]
pub struct Event {
    id: String,
    timestamp: i64,
    path: Vec<String>,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl Event {
    /// Creates a binary event with a fresh id and the current timestamp.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self::from_parts(
            Uuid::new_v4().to_string(),
            chrono::Utc::now().timestamp_millis(),
            Vec::new(),
            HashMap::new(),
            body.into(),
        )
        .with_content_type(ContentType::Binary)
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Reassembles an event from its wire fields, as-is.
    pub fn from_parts(
        id: String,
        timestamp: i64,
        path: Vec<String>,
        headers: HashMap<String, String>,
        body: Bytes,
    ) -> Self {
        Self {
            id,
            timestamp,
            path,
            headers,
            body,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(body.into()).with_content_type(ContentType::Text)
    }

    pub fn int(value: i32) -> Self {
        Self::new(value.to_string()).with_content_type(ContentType::Int)
    }

    pub fn long(value: i64) -> Self {
        Self::new(value.to_string()).with_content_type(ContentType::Long)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(value.to_string()).with_content_type(ContentType::Bool)
    }

    /// JSON body; arrays are tagged [`ContentType::JsonArray`].
    pub fn json(value: &serde_json::Value) -> Self {
        let content_type = if value.is_array() {
            ContentType::JsonArray
        } else {
            ContentType::Json
        };
        Self::new(value.to_string()).with_content_type(content_type)
    }

    /// Wraps raw bytes already encoded as `content_type`.
    pub fn with_body(body: impl Into<Bytes>, content_type: ContentType) -> Self {
        Self::new(body).with_content_type(content_type)
    }

    /// A failure reply: text body with an error status.
    pub fn failure(status: Status, message: impl Into<String>) -> Self {
        Self::text(message).with_status(status)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation instant, epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Appends one stage id to the path.
    #[must_use]
    pub fn add_path(mut self, stage_id: impl Into<String>) -> Self {
        self.path.push(stage_id.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    /// Replaces the path with `source`'s path plus `stage_id`.
    #[must_use]
    pub fn extend_path(mut self, source: &Event, stage_id: impl Into<String>) -> Self {
        let mut path = Vec::with_capacity(source.path.len() + 1);
        path.extend(source.path.iter().cloned());
        path.push(stage_id.into());
        self.path = path;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut headers = self.headers.clone();
        headers.insert(key.into(), value.into());
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_headers<K, V>(mut self, extra: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut headers = self.headers.clone();
        headers.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_content_type(self, content_type: ContentType) -> Self {
        self.with_header(CONTENT_TYPE_HEADER, content_type.media_type())
    }

    #[must_use]
    pub fn with_status(self, status: Status) -> Self {
        self.with_header(STATUS_HEADER, status.code().to_string())
    }

    #[must_use]
    pub fn with_file_path(self, path: impl Into<String>) -> Self {
        self.with_header(FILE_PATH_HEADER, path)
    }

    /// Marks this event as the reply to `request`.
    #[must_use]
    pub fn reply_to(self, request: &Event) -> Self {
        self.reply_to_id(request.id.clone())
    }

    #[must_use]
    pub fn reply_to_id(self, request_id: impl Into<String>) -> Self {
        self.with_header(REPLY_TO_HEADER, request_id)
    }

    /// Id of the request this event answers, if any.
    pub fn in_reply_to(&self) -> Option<&str> {
        self.header(REPLY_TO_HEADER)
    }

    /// Declared content type, binary when the header is absent or unknown.
    pub fn content_type(&self) -> ContentType {
        ContentType::from_media_type(self.header(CONTENT_TYPE_HEADER), ContentType::Binary)
    }

    /// Declared status, OK when absent or unknown.
    pub fn status(&self) -> Status {
        let code = self.header(STATUS_HEADER).and_then(|s| s.parse().ok());
        Status::from_code(code, Status::Ok)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.header(FILE_PATH_HEADER)
    }

    /// Derives a new event from this one: fresh id, same body and content
    /// type, path extended by `stage_id`.
    #[must_use]
    pub fn make_child(&self, stage_id: impl Into<String>) -> Event {
        Event::new(self.body.clone())
            .with_content_type(self.content_type())
            .extend_path(self, stage_id)
    }

    /// Body interpreted by its declared content type.
    pub fn payload(&self) -> Result<Payload> {
        as_content_type(&self.body, self.content_type())
    }

    pub fn payload_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn payload_as_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn payload_as_bool(&self) -> bool {
        coerce::as_bool(&Value::String(self.payload_as_string())).unwrap_or(false)
    }

    pub fn payload_as_int(&self) -> i32 {
        coerce::as_int(&Value::String(self.payload_as_string())).unwrap_or(0)
    }

    pub fn payload_as_long(&self) -> i64 {
        coerce::as_long(&Value::String(self.payload_as_string())).unwrap_or(0)
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.body
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(id='{}', timestamp={}, path={:?}, headers={:?}, body={} bytes)",
            self.id,
            self.timestamp,
            self.path,
            self.headers,
            self.body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_tag_content_type() {
        assert_eq!(Event::text("hi").content_type(), ContentType::Text);
        assert_eq!(Event::int(3).content_type(), ContentType::Int);
        assert_eq!(Event::long(3).content_type(), ContentType::Long);
        assert_eq!(Event::bool(true).content_type(), ContentType::Bool);
        assert_eq!(Event::json(&json!({"a": 1})).content_type(), ContentType::Json);
        assert_eq!(Event::json(&json!([1, 2])).content_type(), ContentType::JsonArray);
        assert_eq!(Event::new(vec![1u8, 2]).content_type(), ContentType::Binary);
    }

    #[test]
    fn missing_content_type_defaults_to_binary() {
        let event = Event::from_parts(
            "x".into(),
            0,
            Vec::new(),
            HashMap::new(),
            Bytes::from_static(b"raw"),
        );
        assert_eq!(event.content_type(), ContentType::Binary);
        assert_eq!(
            event.payload().unwrap(),
            Payload::Bytes(Bytes::from_static(b"raw"))
        );
    }

    #[test]
    fn make_child_appends_exactly_one_path_element() {
        let source = Event::text("hello").add_path("a").add_path("b");
        let child = source.make_child("c");

        assert_ne!(child.id(), source.id());
        assert_eq!(child.path(), &["a", "b", "c"]);
        assert_eq!(child.body(), source.body());
        assert_eq!(child.content_type(), ContentType::Text);
        assert_eq!(source.path(), &["a", "b"]);
    }

    #[test]
    fn extend_path_uses_source_path() {
        let source = Event::text("s").add_path("p1");
        let derived = Event::int(1).add_path("ignored").extend_path(&source, "p2");
        assert_eq!(derived.path(), &["p1", "p2"]);
    }

    #[test]
    fn equality_is_by_id() {
        let a = Event::text("a");
        let tagged = a.clone().with_status(Status::NotFound);
        assert_eq!(a, tagged);
        assert_ne!(a, Event::text("a"));
    }

    #[test]
    fn typed_payloads() {
        assert_eq!(Event::int(42).payload().unwrap(), Payload::Int(42));
        assert_eq!(Event::long(-9).payload_as_long(), -9);
        assert!(Event::bool(true).payload_as_bool());
        assert_eq!(
            Event::json(&json!({"k": "v"})).payload().unwrap(),
            Payload::Json(json!({"k": "v"}))
        );
        assert_eq!(
            Event::text("<p/>")
                .with_content_type(ContentType::Html)
                .payload()
                .unwrap(),
            Payload::Bytes(Bytes::from_static(b"<p/>"))
        );
        assert_eq!(
            Event::with_body("<br/>", ContentType::Xhtml).payload().unwrap(),
            Payload::Text("<br/>".into())
        );
        // malformed numbers fall back to zero
        assert_eq!(
            Event::with_body("abc", ContentType::Int).payload().unwrap(),
            Payload::Int(0)
        );
    }

    #[test]
    fn malformed_json_body_is_an_error() {
        let event = Event::with_body("{not json", ContentType::Json);
        assert!(event.payload().is_err());
        let wrong_shape = Event::with_body("[1]", ContentType::Json);
        assert!(matches!(wrong_shape.payload(), Err(RelayError::Decode(_))));
    }

    #[test]
    fn status_and_reply_headers() {
        let request = Event::text("ping");
        let reply = Event::text("pong")
            .reply_to(&request)
            .with_status(Status::Created)
            .with_file_path("/tmp/x");
        assert_eq!(reply.in_reply_to(), Some(request.id()));
        assert_eq!(reply.status(), Status::Created);
        assert_eq!(reply.file_path(), Some("/tmp/x"));
        assert_eq!(Event::text("x").status(), Status::Ok);
    }

    #[test]
    fn content_type_lookup_is_case_insensitive() {
        assert_eq!(
            ContentType::from_media_type(Some("TEXT/PLAIN"), ContentType::Binary),
            ContentType::Text
        );
        assert_eq!(
            ContentType::from_name(Some("jsona"), ContentType::Text),
            ContentType::JsonArray
        );
        assert_eq!(
            ContentType::from_name(Some("nope"), ContentType::Text),
            ContentType::Text
        );
    }
}
