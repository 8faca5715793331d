//! Serde helpers for durations written as integer milliseconds
//!
//! ```ignore
//! #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
//! pub timeout: Duration,
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serialize a duration as whole milliseconds
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Deserialize whole milliseconds into a duration
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
