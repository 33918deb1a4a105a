//! The message envelope every module publishes and receives.
//!
//! On the wire an envelope is a single UTF-8 JSON object:
//!
//! ```json
//! {"id": "...", "ts": "2024-01-01T12:00:00.000Z", "source": "asr",
//!  "type": "asr.text", "corr": "...", "payload": {...}, "meta": {"ver": "1.0"}}
//! ```

use crate::error::BusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Protocol version stamped into `meta.ver`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Domain payload, opaque to the bus.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Envelope metadata. Unknown keys are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub ver: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for EnvelopeMeta {
    fn default() -> Self {
        Self {
            ver: PROTOCOL_VERSION.to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A single bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per message
    pub id: String,
    /// UTC, millisecond precision, trailing `Z`
    pub ts: String,
    /// Producing module
    pub source: String,
    /// Dotted event type, e.g. `asr.text`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Correlation id linking requests and replies
    pub corr: String,
    pub payload: Payload,
    pub meta: EnvelopeMeta,
}

/// Why an inbound message could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope field '{0}' is empty")]
    EmptyField(&'static str),
}

impl Envelope {
    /// Build a new envelope, filling `id`, `ts` and `meta.ver`.
    ///
    /// `source` and `event_type` must be non-empty, the same rule
    /// [`Envelope::decode`] applies. A missing or empty `corr` gets a fresh
    /// id so replies can always be correlated.
    pub fn build(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: Payload,
        corr: Option<String>,
    ) -> Result<Self, BusError> {
        let source = source.into();
        if source.is_empty() {
            return Err(BusError::EmptyField("source"));
        }
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(BusError::EmptyField("type"));
        }
        let corr = corr
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            ts: utc_timestamp(),
            source,
            event_type,
            corr,
            payload,
            meta: EnvelopeMeta::default(),
        })
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the wire, reporting why decoding failed.
    pub fn try_decode(raw: impl AsRef<[u8]>) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(raw.as_ref())?;
        envelope.check_required()?;
        Ok(envelope)
    }

    /// Decode from the wire. Malformed input yields `None`, never a panic.
    pub fn decode(raw: impl AsRef<[u8]>) -> Option<Self> {
        Self::try_decode(raw).ok()
    }

    /// Parse `ts` back into a datetime, if it is well formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn check_required(&self) -> Result<(), DecodeError> {
        let fields = [
            ("id", &self.id),
            ("ts", &self.ts),
            ("source", &self.source),
            ("type", &self.event_type),
            ("corr", &self.corr),
            ("meta.ver", &self.meta.ver),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(DecodeError::EmptyField(name));
            }
        }
        Ok(())
    }
}

/// Current UTC time as ISO-8601 with milliseconds and a `Z` suffix.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
