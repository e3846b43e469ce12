//! Request/response envelopes carried inside the encrypted tunnel.
//!
//! Envelopes are serialized as JSON with camelCase field tags; byte
//! fields travel base64-encoded. Two request shapes are legal:
//!
//!   * initiating — `verb` and `path` both present, `chunk` optional
//!     (present means a streaming upload begins with this envelope);
//!   * continuation — neither `verb` nor `path`, `chunk` required.
//!
//! Everything else is a protocol error, and a protocol error on a live
//! tunnel means a broken client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Base64 byte fields ────────────────────────────────────────────────────────

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// ── Request side ──────────────────────────────────────────────────────────────

/// One fragment of a streamed request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyChunk {
    #[serde(with = "b64")]
    pub data: Vec<u8>,

    /// Position of this fragment; the receiver writes fragments in
    /// ascending seq order regardless of arrival order.
    pub seq: u32,

    #[serde(default)]
    pub is_final: bool,
}

/// Client → gateway envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub body: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<BodyChunk>,
}

/// The two legal request shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    Initiating,
    Continuation,
}

impl RequestEnvelope {
    /// Validate the shape rules from the module docs.
    pub fn classify(&self) -> Result<RequestShape, ProtocolError> {
        match (&self.verb, &self.path) {
            (Some(_), Some(_)) => Ok(RequestShape::Initiating),
            (None, None) => {
                if self.chunk.is_some() {
                    Ok(RequestShape::Continuation)
                } else {
                    Err(ProtocolError::EmptyEnvelope)
                }
            }
            _ => Err(ProtocolError::VerbPathMismatch),
        }
    }

    /// Parse and shape-check one application message.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: RequestEnvelope = serde_json::from_slice(bytes)?;
        envelope.classify()?;
        Ok(envelope)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }
}

// ── Response side ─────────────────────────────────────────────────────────────

/// Gateway → client envelope. Streaming responses emit several
/// envelopes sharing one id with status 200; headers ride on the first
/// envelope only, and a zero-length body marks end-of-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: u64,
    pub status: u16,

    #[serde(with = "b64", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl ResponseEnvelope {
    /// An error reply: numeric status plus a short message body.
    pub fn error(id: u64, status: u16, message: &str) -> Self {
        Self {
            id,
            status,
            body: message.as_bytes().to_vec(),
            headers: None,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Protocol-level decode failures. Any of these on a live tunnel is
/// fatal for the whole session, not just the offending id.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope does not parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("verb and path must be present together")]
    VerbPathMismatch,

    #[error("envelope carries neither an operation nor a chunk")]
    EmptyEnvelope,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
