//! Message representation shared by the whole runtime.
//!
//! A [`WireMessage`] is what broker adapters hand to the polling source; a
//! [`Message`] is the immutable, typed representation flowing through the
//! processing pipeline. Conversion between the two happens through the
//! [`MessageConverter`] seam and is isolated per message: one failed
//! conversion never fails the rest of a poll batch.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ConversionError;

/// Well-known header names written by the built-in converters.
pub mod headers {
    /// The broker-assigned id of the wire message a [`super::Message`] was
    /// converted from.
    pub const SOURCE_MESSAGE_ID: &str = "sluice.source-message-id";
    /// The ordering-group key, mirrored into headers for listeners that only
    /// see headers.
    pub const GROUP_ID: &str = "sluice.group-id";
    /// When the broker recorded the message as sent, RFC 3339.
    pub const SENT_TIMESTAMP: &str = "sluice.sent-timestamp";
}

/// Unique id assigned to every converted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generates a fresh id.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_str(s)?))
    }
}

/// Broker receipt token used to confirm delivery of a single message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckHandle(String);

impl AckHandle {
    /// Wraps a broker receipt token.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AckHandle {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AckHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Key identifying an ordering group (e.g. a FIFO message group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    /// Wraps a group key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for GroupKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of the queue a consumer is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueIdentity {
    name: String,
    url: String,
}

impl QueueIdentity {
    /// Creates a queue identity from its name and endpoint url.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue endpoint url.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Message headers. Insertion order is irrelevant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Looks a header up by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether the given header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all headers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A message as received from the broker, before conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Broker-assigned message id.
    pub message_id: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Broker headers/attributes.
    pub headers: Headers,
    /// Receipt token for acknowledging this delivery.
    pub receipt: AckHandle,
    /// Ordering-group key, when the queue provides one.
    pub group: Option<GroupKey>,
    /// When the broker recorded the message as sent, when known.
    pub sent_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Creates a wire message with empty headers and no group.
    pub fn new(
        message_id: impl Into<String>,
        payload: impl Into<Bytes>,
        receipt: impl Into<AckHandle>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            payload: payload.into(),
            headers: Headers::new(),
            receipt: receipt.into(),
            group: None,
            sent_at: None,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the ordering-group key.
    pub fn with_group(mut self, group: impl Into<GroupKey>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the broker sent timestamp.
    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }
}

/// A converted message owned by the pipeline invocation processing it.
///
/// Immutable after creation; interceptors transform messages by producing new
/// ones (see [`Message::map`]).
#[derive(Debug, Clone)]
pub struct Message<T> {
    id: MessageId,
    payload: T,
    headers: Headers,
    ack_handle: AckHandle,
    group: Option<GroupKey>,
    received_at: DateTime<Utc>,
}

impl<T> Message<T> {
    /// Creates a message with a fresh id and the current receive timestamp.
    pub fn new(payload: T, ack_handle: impl Into<AckHandle>) -> Self {
        Self {
            id: MessageId::new(),
            payload,
            headers: Headers::new(),
            ack_handle: ack_handle.into(),
            group: None,
            received_at: Utc::now(),
        }
    }

    /// Replaces the headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the ordering-group key.
    pub fn with_group(mut self, group: impl Into<GroupKey>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// The internal message id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The typed payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes the message, returning the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// The message headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The receipt handle used to acknowledge this delivery.
    pub fn ack_handle(&self) -> &AckHandle {
        &self.ack_handle
    }

    /// The ordering-group key, if any.
    pub fn group(&self) -> Option<&GroupKey> {
        self.group.as_ref()
    }

    /// When the message was converted.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Transforms the payload, keeping id, headers, handle and group.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: self.id,
            payload: f(self.payload),
            headers: self.headers,
            ack_handle: self.ack_handle,
            group: self.group,
            received_at: self.received_at,
        }
    }
}

/// Converts wire messages into typed [`Message`]s.
///
/// May fail per message; the polling source isolates failures so the rest of
/// the batch still flows downstream.
pub trait MessageConverter<T>: Send + Sync {
    /// Converts a single wire message.
    fn convert(&self, wire: WireMessage) -> Result<Message<T>, ConversionError>;
}

impl<T, F> MessageConverter<T> for F
where
    F: Fn(WireMessage) -> Result<Message<T>, ConversionError> + Send + Sync,
{
    fn convert(&self, wire: WireMessage) -> Result<Message<T>, ConversionError> {
        (self)(wire)
    }
}

/// Passthrough converter keeping the payload as raw bytes.
///
/// Carries the broker message id and group key over into headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesConverter;

impl MessageConverter<Bytes> for BytesConverter {
    fn convert(&self, wire: WireMessage) -> Result<Message<Bytes>, ConversionError> {
        let WireMessage {
            message_id,
            payload,
            mut headers,
            receipt,
            group,
            sent_at,
        } = wire;
        headers.insert(headers::SOURCE_MESSAGE_ID, message_id);
        if let Some(group) = &group {
            headers.insert(headers::GROUP_ID, group.as_str());
        }
        if let Some(sent_at) = sent_at {
            headers.insert(headers::SENT_TIMESTAMP, sent_at.to_rfc3339());
        }
        let mut message = Message::new(payload, receipt).with_headers(headers);
        if let Some(group) = group {
            message = message.with_group(group);
        }
        Ok(message)
    }
}
