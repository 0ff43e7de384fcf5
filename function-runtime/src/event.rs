//! Turns an inbound request into an [`Event`]
//!
//! Requests are classified as CloudEvents when they use the structured
//! content mode (`application/cloudevents+json`) or when they carry both a
//! `ce-type` and a `ce-source` header (binary mode). Everything else is a
//! plain event whose body is parsed as JSON when the content type says so.
//! Normalization never fails: whatever cannot be parsed is kept as bytes.

use std::collections::BTreeMap;

use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use crate::error::NormalizeError;
use crate::types::{Event, EventData, EventKind, Extensions, Headers, RawRequest};

pub const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

const CE_PREFIX: &str = "ce-";

/// Headers mapped onto the core attribute fields rather than extensions
const CORE_HEADERS: [&str; 6] = [
    "ce-type",
    "ce-source",
    "ce-id",
    "ce-time",
    "ce-specversion",
    "ce-eventtypeversion",
];

/// Build the event for `request`, consuming its buffered body.
pub fn normalize(request: RawRequest) -> Event {
    let media_type = request.headers.get("content-type").map(media_type);

    if media_type.as_deref() == Some(CLOUDEVENTS_JSON) {
        return structured(request);
    }

    if request.headers.contains("ce-type") && request.headers.contains("ce-source") {
        let data = body_data(&request.body, media_type.as_deref());
        return from_headers(EventKind::CloudEventBinary, data, request);
    }

    let data = body_data(&request.body, media_type.as_deref());
    Event {
        data,
        kind: EventKind::Plain,
        event_type: None,
        event_source: None,
        event_id: None,
        event_time: None,
        spec_version: None,
        event_type_version: None,
        extensions: Extensions {
            request,
            attributes: BTreeMap::new(),
        },
    }
}

/// The media type of a `content-type` value, lower-cased, without parameters.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(media_type: &str) -> bool {
    media_type == "application/json" || media_type.ends_with("+json")
}

fn body_data(body: &Bytes, media_type: Option<&str>) -> EventData {
    if body.is_empty() {
        return EventData::Empty;
    }
    match media_type {
        Some(media_type) if is_json(media_type) => match parse_json(body) {
            Ok(value) => EventData::Json(value),
            Err(reason) => {
                debug!(%reason, "normalization degraded to raw bytes");
                EventData::Bytes(body.clone())
            }
        },
        _ => EventData::Bytes(body.clone()),
    }
}

fn parse_json(body: &Bytes) -> Result<serde_json::Value, NormalizeError> {
    Ok(serde_json::from_slice(body)?)
}

fn from_headers(kind: EventKind, data: EventData, request: RawRequest) -> Event {
    let header = |name: &str| request.headers.get(name).map(str::to_owned);
    let attributes = request
        .headers
        .iter()
        .filter(|(name, _)| name.starts_with(CE_PREFIX) && !CORE_HEADERS.contains(name))
        .map(|(name, value)| (name[CE_PREFIX.len()..].to_owned(), value.to_owned()))
        .collect();

    Event {
        data,
        kind,
        event_type: header("ce-type"),
        event_source: header("ce-source"),
        event_id: header("ce-id"),
        event_time: header("ce-time"),
        spec_version: header("ce-specversion"),
        event_type_version: header("ce-eventtypeversion"),
        extensions: Extensions {
            request,
            attributes,
        },
    }
}

#[derive(Deserialize)]
struct Envelope {
    specversion: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    source: Option<String>,
    id: Option<String>,
    time: Option<String>,
    eventtypeversion: Option<String>,
    datacontenttype: Option<String>,
    data: Option<serde_json::Value>,
    data_base64: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

fn structured(request: RawRequest) -> Event {
    let envelope: Envelope = match serde_json::from_slice(&request.body) {
        Ok(envelope) => envelope,
        Err(reason) => {
            debug!(%reason, "cloudevent envelope unreadable, keeping raw body");
            let data = if request.body.is_empty() {
                EventData::Empty
            } else {
                EventData::Bytes(request.body.clone())
            };
            return from_headers(EventKind::CloudEventStructured, data, request);
        }
    };

    let data = envelope_data(&envelope);
    let attributes = envelope
        .extra
        .into_iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::String(value) => Some((name, value)),
            _ => None,
        })
        .collect();

    Event {
        data,
        kind: EventKind::CloudEventStructured,
        event_type: envelope.event_type,
        event_source: envelope.source,
        event_id: envelope.id,
        event_time: envelope.time,
        spec_version: envelope.specversion,
        event_type_version: envelope.eventtypeversion,
        extensions: Extensions {
            request,
            attributes,
        },
    }
}

fn envelope_data(envelope: &Envelope) -> EventData {
    if let Some(encoded) = &envelope.data_base64 {
        return match decode_base64(encoded) {
            Ok(bytes) => EventData::Bytes(bytes),
            Err(reason) => {
                debug!(%reason, "normalization degraded to text");
                EventData::Text(encoded.clone())
            }
        };
    }

    let json_content = envelope
        .datacontenttype
        .as_deref()
        .map(media_type)
        .map_or(true, |media_type| is_json(&media_type));

    match &envelope.data {
        None => EventData::Empty,
        Some(serde_json::Value::String(text)) if !json_content => EventData::Text(text.clone()),
        Some(value) => EventData::Json(value.clone()),
    }
}

fn decode_base64(encoded: &str) -> Result<Bytes, NormalizeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    Ok(Bytes::from(bytes))
}
