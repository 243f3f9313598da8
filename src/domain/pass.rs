//! Visitor pass data model
//!
//! A `Pass` tracks one visit from registration through entry and exit.
//! Fields are crate-visible only: mutation goes through the lifecycle
//! transitions in `services::lifecycle`, and the registry owns the stored copy.

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a new pass ID (UUIDv7, time-sortable)
pub fn new_pass_id() -> Uuid {
    Uuid::now_v7()
}

/// Pass status. Ordering follows the lifecycle: `Pending < Inside < Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PassStatus {
    Pending,
    Inside,
    Exited,
}

impl PassStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Pending => "PENDING",
            PassStatus::Inside => "INSIDE",
            PassStatus::Exited => "EXITED",
        }
    }

    /// The only status a pass may move to from this one
    pub fn successor(&self) -> Option<PassStatus> {
        match self {
            PassStatus::Pending => Some(PassStatus::Inside),
            PassStatus::Inside => Some(PassStatus::Exited),
            PassStatus::Exited => None,
        }
    }
}

impl fmt::Display for PassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PassStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PassStatus::Pending),
            "INSIDE" => Ok(PassStatus::Inside),
            "EXITED" => Ok(PassStatus::Exited),
            other => Err(format!("unknown pass status '{other}'")),
        }
    }
}

/// One-time entry code handed to the guest at registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryCode(String);

impl EntryCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized vehicle registration plate
///
/// Uppercase ASCII alphanumerics only, so `"ka-01 ab 1234"` and
/// `"KA01AB1234"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plate(String);

impl Plate {
    /// Normalize raw plate text. Returns `None` if nothing usable remains.
    ///
    /// ```
    /// use gatepass::domain::pass::Plate;
    ///
    /// let plate = Plate::parse(" ka-01 ab.1234 ").unwrap();
    /// assert_eq!(plate.as_str(), "KA01AB1234");
    /// assert!(Plate::parse(" - ").is_none());
    /// ```
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A visitor pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass {
    pub(crate) id: Uuid,
    pub(crate) entry_code: EntryCode,
    pub(crate) guest_name: String,
    pub(crate) host_name: String,
    pub(crate) unit: String,
    #[serde(default)]
    pub(crate) plate: Option<Plate>,
    #[serde(default, with = "image_b64", skip_serializing_if = "Option::is_none")]
    pub(crate) plate_image: Option<Bytes>,
    #[serde(default, with = "image_b64", skip_serializing_if = "Option::is_none")]
    pub(crate) original_image: Option<Bytes>,
    pub(crate) status: PassStatus,
    pub(crate) created_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) exit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) recognition_confidence: Option<f32>,
}

impl Pass {
    /// Create a new pending pass. Identity fields are trimmed.
    pub(crate) fn new(
        entry_code: EntryCode,
        guest_name: &str,
        host_name: &str,
        unit: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_pass_id(),
            entry_code,
            guest_name: guest_name.trim().to_string(),
            host_name: host_name.trim().to_string(),
            unit: unit.trim().to_string(),
            plate: None,
            plate_image: None,
            original_image: None,
            status: PassStatus::Pending,
            created_at: now,
            entry_time: None,
            exit_time: None,
            recognition_confidence: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn entry_code(&self) -> &EntryCode {
        &self.entry_code
    }

    pub fn guest_name(&self) -> &str {
        &self.guest_name
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn plate(&self) -> Option<&Plate> {
        self.plate.as_ref()
    }

    pub fn plate_image(&self) -> Option<&Bytes> {
        self.plate_image.as_ref()
    }

    pub fn original_image(&self) -> Option<&Bytes> {
        self.original_image.as_ref()
    }

    pub fn status(&self) -> PassStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn entry_time(&self) -> Option<DateTime<Utc>> {
        self.entry_time
    }

    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        self.exit_time
    }

    pub fn recognition_confidence(&self) -> Option<f32> {
        self.recognition_confidence
    }

    pub fn has_images(&self) -> bool {
        self.plate_image.is_some() || self.original_image.is_some()
    }

    /// Check the record-level invariants of a pass.
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.entry_code.is_empty() {
            return Err("entry code is empty".to_string());
        }
        let holds_plate = matches!(self.status, PassStatus::Inside | PassStatus::Exited);
        if self.plate.is_some() != holds_plate {
            return Err(format!("plate presence does not match status {}", self.status));
        }
        if holds_plate && self.entry_time.is_none() {
            return Err(format!("status {} without entry time", self.status));
        }
        if (self.status == PassStatus::Exited) != self.exit_time.is_some() {
            return Err(format!("exit time presence does not match status {}", self.status));
        }
        if let (Some(entry), Some(exit)) = (self.entry_time, self.exit_time) {
            if exit < entry {
                return Err("exit time precedes entry time".to_string());
            }
        }
        Ok(())
    }
}

/// Decode an image payload given as base64 or as a `data:` URL
pub fn decode_image(raw: &str) -> Result<Bytes, base64::DecodeError> {
    let payload = match raw.split_once(";base64,") {
        Some((_, data)) => data,
        None => raw,
    };
    STANDARD.decode(payload.trim()).map(Bytes::from)
}

/// Encode an image payload as plain base64
pub fn encode_image(image: &[u8]) -> String {
    STANDARD.encode(image)
}

/// Serde adapter for optional image payloads carried as base64 strings
pub mod image_b64 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(image) => serializer.serialize_some(&encode_image(image)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) if !s.trim().is_empty() => {
                decode_image(&s).map(Some).map_err(serde::de::Error::custom)
            }
            _ => Ok(None),
        }
    }
}
