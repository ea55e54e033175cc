//! Payload conversion between wire text and application values.
//!
//! A [`Payload`] is the tagged shape the engine moves response bodies around
//! in; a [`PayloadHandler`] normalizes raw wire input into one of those shapes
//! and back into storable text. The request handler applies its handler to
//! network responses, and every cache repository applies its own to the rows
//! it stores, so the two stay swappable independently.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::error::PayloadError;

/// A response payload in one of the shapes the engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Parsed JSON.
    Json(Value),
}

impl Payload {
    /// The payload as text. Bytes must be valid UTF-8; JSON is rendered
    /// compactly.
    pub fn into_text(self) -> Result<String, PayloadError> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Bytes(bytes) => Ok(String::from_utf8(bytes)?),
            Payload::Json(value) => Ok(value.to_string()),
        }
    }

    /// The payload as raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Bytes(bytes) => bytes,
            Payload::Json(value) => value.to_string().into_bytes(),
        }
    }

    /// The payload as parsed JSON.
    pub fn into_json(self) -> Result<Value, PayloadError> {
        match self {
            Payload::Text(text) => Ok(serde_json::from_str(&text)?),
            Payload::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Payload::Json(value) => Ok(value),
        }
    }

    /// Deserialize the payload into a typed value via JSON.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, PayloadError> {
        Ok(serde_json::from_value(self.into_json()?)?)
    }

    /// Borrow the text when the payload already is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Borrow the JSON value when the payload already is JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Converts between wire text and one payload shape.
///
/// Both directions must be idempotent: feeding a handler its own output is a
/// no-op, so already-serialized cache rows and already-typed values pass
/// through unchanged.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    /// Render a payload as the text form stored in a cache.
    async fn serialize(&self, payload: &Payload) -> Result<String, PayloadError>;

    /// Normalize raw wire input into this handler's payload shape.
    async fn deserialize(&self, raw: Payload) -> Result<Payload, PayloadError>;
}

/// Passes response bodies through as plain text. The default handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringPayloadHandler;

#[async_trait]
impl PayloadHandler for StringPayloadHandler {
    async fn serialize(&self, payload: &Payload) -> Result<String, PayloadError> {
        payload.clone().into_text()
    }

    async fn deserialize(&self, raw: Payload) -> Result<Payload, PayloadError> {
        Ok(Payload::Text(raw.into_text()?))
    }
}

/// Hands response bodies over as raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesPayloadHandler;

#[async_trait]
impl PayloadHandler for BytesPayloadHandler {
    async fn serialize(&self, payload: &Payload) -> Result<String, PayloadError> {
        payload.clone().into_text()
    }

    async fn deserialize(&self, raw: Payload) -> Result<Payload, PayloadError> {
        Ok(Payload::Bytes(raw.into_bytes()))
    }
}

/// Parses response bodies as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPayloadHandler {
    pretty: bool,
}

impl JsonPayloadHandler {
    /// A handler rendering compact JSON.
    pub fn new() -> Self {
        Self { pretty: false }
    }

    /// A handler rendering indented JSON, for caches meant to be read by
    /// humans.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

#[async_trait]
impl PayloadHandler for JsonPayloadHandler {
    async fn serialize(&self, payload: &Payload) -> Result<String, PayloadError> {
        let value = payload.clone().into_json()?;
        if self.pretty {
            Ok(serde_json::to_string_pretty(&value)?)
        } else {
            Ok(value.to_string())
        }
    }

    async fn deserialize(&self, raw: Payload) -> Result<Payload, PayloadError> {
        Ok(Payload::Json(raw.into_json()?))
    }
}
