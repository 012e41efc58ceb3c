//! Normalization of raw broker messages.
//!
//! Providers name the same facts differently (`message_id` vs `messageId`,
//! `timestamp` in seconds vs an RFC 3339 `enqueuedTimeUtc`). [`normalize`]
//! maps them onto [`Message`] and never fails on missing fields.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{Message, MessageBody, RawMessage};

const ID_KEYS: &[&str] = &["message_id", "messageId", "message-id", "id"];
const SEQUENCE_KEYS: &[&str] = &["sequence_number", "sequenceNumber", "delivery_tag", "offset"];
const LABEL_KEYS: &[&str] = &["label", "subject", "type", "routing_key"];
const ENQUEUED_KEYS: &[&str] = &["timestamp", "enqueued_time", "enqueuedTimeUtc", "enqueued_at"];
const DELIVERY_COUNT_KEYS: &[&str] = &["delivery_count", "deliveryCount", "x-delivery-count"];

/// Epoch values above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Normalize a drained message.
///
/// `position` is the message's index within the drain sequence of the
/// current operation. It only affects the id of messages without a
/// provider id.
pub fn normalize(raw: &RawMessage, position: u64) -> Message {
    let (id, provider_id) = match provider_id(raw) {
        Some(id) => (id, true),
        None => (derive_id(&raw.body, position), false),
    };

    Message {
        id,
        provider_id,
        sequence_hint: lookup(raw, SEQUENCE_KEYS)
            .and_then(as_i64)
            .unwrap_or(position as i64),
        label: lookup(raw, LABEL_KEYS)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        size_bytes: raw.body.len(),
        enqueued_at: lookup(raw, ENQUEUED_KEYS)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        delivery_count: delivery_count(raw),
        redelivered: raw.redelivered,
        raw_properties: raw.properties.clone(),
        headers: raw.headers.clone(),
        body: MessageBody::from_bytes(raw.body.clone()),
    }
}

/// Id for a message the broker gave no id: content hash plus position.
pub fn derive_id(body: &[u8], position: u64) -> String {
    let digest = Sha256::digest(body);
    format!("{}-{}", &hex::encode(digest)[..16], position)
}

fn provider_id(raw: &RawMessage) -> Option<String> {
    ID_KEYS
        .iter()
        .find_map(|key| raw.properties.get(*key))
        .and_then(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Property lookup, falling back to application headers.
fn lookup<'a>(raw: &'a RawMessage, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| raw.properties.get(*key))
        .or_else(|| keys.iter().find_map(|key| raw.headers.get(*key)))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn delivery_count(raw: &RawMessage) -> u32 {
    lookup(raw, DELIVERY_COUNT_KEYS)
        .and_then(as_i64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(u32::from(raw.redelivered))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if raw > MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| as_i64(value).and_then(|n| parse_timestamp(&Value::from(n)))),
        _ => None,
    }
}
