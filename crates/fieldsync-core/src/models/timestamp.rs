//! Timestamp parsing and storage conversion
//!
//! Wire timestamps are ISO-8601 strings. Offsets are honoured; naive values
//! (no offset) are read as UTC. Storage uses integer unix microseconds so SQL
//! comparisons are exact.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 timestamp into UTC, truncated to storage precision.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(truncate(parsed.with_timezone(&Utc)));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| truncate(naive.and_utc()))
        .ok_or_else(|| format!("invalid timestamp `{value}`"))
}

/// Render a timestamp in RFC 3339 with a `Z` suffix.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Storage representation of a timestamp.
pub fn to_micros(value: &DateTime<Utc>) -> i64 {
    value.timestamp_micros()
}

/// Inverse of [`to_micros`]; `None` when out of chrono's range.
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Current wall-clock time truncated to storage precision.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

fn truncate(value: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(to_micros(&value)).unwrap_or(value)
}

/// Serde adapter for required timestamps using the lenient parser.
pub mod serde_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional timestamps; `null` and absent both map to `None`.
pub mod serde_timestamp_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_str(&super::format_timestamp(value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| super::parse_timestamp(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
