use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Contains information about the call to the user function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The request body, decoded according to its content type
    pub data: EventData,

    /// How the event was recognised
    pub kind: EventKind,

    /// CloudEvents `type` attribute
    pub event_type: Option<String>,

    /// CloudEvents `source` attribute
    pub event_source: Option<String>,

    /// CloudEvents `id` attribute
    pub event_id: Option<String>,

    /// CloudEvents `time` attribute, copied verbatim
    pub event_time: Option<String>,

    /// CloudEvents `specversion` attribute
    pub spec_version: Option<String>,

    /// Kyma `eventtypeversion` extension
    pub event_type_version: Option<String>,

    pub extensions: Extensions,
}

impl Event {
    pub fn is_cloud_event(&self) -> bool {
        self.kind != EventKind::Plain
    }
}

/// Whether and how an event was carried as a CloudEvent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Plain,
    /// Attributes in `ce-*` headers, data in the body
    CloudEventBinary,
    /// Whole event as an `application/cloudevents+json` envelope
    CloudEventStructured,
}

/// The payload of an [`Event`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventData {
    Empty,
    Json(#[serde(with = "json_text")] serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

impl EventData {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            EventData::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The data as raw bytes; JSON is re-encoded.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            EventData::Empty => Bytes::new(),
            EventData::Json(value) => Bytes::from(value.to_string()),
            EventData::Text(text) => Bytes::from(text.clone()),
            EventData::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// Everything about the event that is not a core attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    /// The buffered inbound request, for handlers that need raw access
    pub request: RawRequest,

    /// CloudEvents extension attributes other than the core set
    pub attributes: BTreeMap<String, String>,
}

/// An owned snapshot of an inbound HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RawRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: String::new(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Request headers with lower-cased names
///
/// Repeated headers are joined with `", "` as HTTP allows for list-valued
/// fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn insert(&mut self, name: &str, value: &str) {
        self.0
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(value) => Some(value.as_str()),
            None => self.0.get(&name.to_ascii_lowercase()).map(String::as_str),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Contains information about the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub function_name: String,
    pub module_name: String,
    pub namespace: String,
    pub runtime: String,
    /// Declared timeout in seconds
    pub timeout: u64,
    /// Memory limit in bytes, `0` when none was provided
    pub memory_limit: u64,
}

/// What a user function returns on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Payload {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Payload::new(value.to_string()).with_content_type("application/json")
    }
}

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

impl From<String> for Payload {
    fn from(body: String) -> Self {
        Payload::new(body).with_content_type(TEXT_PLAIN)
    }
}

impl From<&str> for Payload {
    fn from(body: &str) -> Self {
        Payload::from(body.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(body: Vec<u8>) -> Self {
        Payload::new(body)
    }
}

impl From<Bytes> for Payload {
    fn from(body: Bytes) -> Self {
        Payload::new(body)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::json(&value)
    }
}

/// The error a user function may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A function callable from the runtime
pub type UserFunction = fn(event: Event, context: &Context) -> Result<Payload, HandlerError>;

/// Named user functions, usually built with [select_function!](crate::select_function)
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Vec<(&'static str, UserFunction)>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &'static str, function: UserFunction) -> Self {
        self.functions.push((name, function));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.iter().map(|(name, _)| *name)
    }

    /// Look up the function exposed under `name`.
    pub fn resolve(&self, name: &str) -> Result<UserFunction, crate::error::ConfigError> {
        self.functions
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, function)| *function)
            .ok_or_else(|| crate::error::ConfigError::UnknownHandler {
                name: name.to_owned(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })
    }
}

/// JSON values cross the worker boundary as text so that non
/// self-describing encoders can carry them.
mod json_text {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
        Ok("hello".into())
    }

    #[test]
    fn test_headers_are_case_insensitive_and_joined() {
        let mut headers = Headers::default();
        headers.insert("Content-Type", "application/json");
        headers.insert("X-Forwarded-For", "10.0.0.1");
        headers.insert("x-forwarded-for", "10.0.0.2");

        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.get("x-forwarded-for"), Some("10.0.0.1, 10.0.0.2"));
        assert!(!headers.contains("ce-type"));
    }

    #[test]
    fn test_payload_conversions_set_content_type() {
        let text: Payload = "hi".into();
        assert_eq!(text.content_type.as_deref(), Some(TEXT_PLAIN));

        let json: Payload = json!({"msg": "ok"}).into();
        assert_eq!(json.content_type.as_deref(), Some("application/json"));
        assert_eq!(&json.body[..], br#"{"msg":"ok"}"#);

        let raw: Payload = vec![1u8, 2, 3].into();
        assert_eq!(raw.content_type, None);
    }

    #[test]
    fn test_registry_resolves_by_name() {
        let registry = FunctionRegistry::new().register("hello", hello);
        assert!(registry.resolve("hello").is_ok());

        let err = registry.resolve("goodbye").err().unwrap();
        assert!(err.to_string().contains("goodbye"));
        assert!(err.to_string().contains("hello"));
    }

    #[test]
    fn test_json_data_survives_binary_encoding() {
        let data = EventData::Json(json!({"a": [1, 2, {"b": null}]}));
        let encoded = bincode::serialize(&data).unwrap();
        let decoded: EventData = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}
