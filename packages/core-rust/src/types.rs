//! Member status, log levels, and the member snapshot record carried by
//! heart-beats.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// MemberStatus
// ---------------------------------------------------------------------------

/// Runtime status of a cluster member as seen by one node.
///
/// Serialized as its numeric wire value (`UNAVAILABLE=0` .. `LEAVING=4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemberStatus {
    #[default]
    Unavailable,
    Passive,
    Active,
    Suspicious,
    Leaving,
}

impl MemberStatus {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unavailable => 0,
            Self::Passive => 1,
            Self::Active => 2,
            Self::Suspicious => 3,
            Self::Leaving => 4,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unavailable),
            1 => Some(Self::Passive),
            2 => Some(Self::Active),
            3 => Some(Self::Suspicious),
            4 => Some(Self::Leaving),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Passive => "passive",
            Self::Active => "active",
            Self::Suspicious => "suspicious",
            Self::Leaving => "leaving",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MemberStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MemberStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown member status {code}")))
    }
}

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

/// Log level, used both for the configured verbosity and for relayed log lines.
///
/// In the configuration document it is the lowercase name; on the `Logs` RPC
/// it travels as its numeric code (`DEBUG=0` .. `ERROR=3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warn),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// MemberRecord
// ---------------------------------------------------------------------------

/// One member's entry in a heart-beat snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub hostname: String,
    pub status: MemberStatus,
    pub latency: String,
    /// RFC 1123 timestamp; [`ZERO_TIMESTAMP`] when nothing was ever received.
    pub last_received: String,
    pub score: i32,
}

impl MemberRecord {
    /// Returns the `last_received` field as milliseconds, `None` for the zero time.
    #[must_use]
    pub fn last_received_millis(&self) -> Option<u64> {
        parse_rfc1123(&self.last_received)
    }
}

// ---------------------------------------------------------------------------
// RFC 1123 timestamps
// ---------------------------------------------------------------------------

/// Rendering of the zero timestamp.
pub const ZERO_TIMESTAMP: &str = "Mon, 01 Jan 0001 00:00:00 UTC";

const RFC1123_BODY: &str = "%a, %d %b %Y %H:%M:%S";

/// Formats milliseconds since the epoch as an RFC 1123 UTC timestamp.
#[must_use]
pub fn format_rfc1123(millis: Option<u64>) -> String {
    let Some(millis) = millis else {
        return ZERO_TIMESTAMP.to_string();
    };
    let Ok(millis) = i64::try_from(millis) else {
        return ZERO_TIMESTAMP.to_string();
    };
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => format!("{} UTC", dt.format(RFC1123_BODY)),
        None => ZERO_TIMESTAMP.to_string(),
    }
}

/// Parses an RFC 1123 timestamp into milliseconds since the epoch.
///
/// The zone token is ignored (senders always emit UTC). The zero timestamp,
/// pre-epoch times and unparseable input all yield `None`.
#[must_use]
pub fn parse_rfc1123(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || value == ZERO_TIMESTAMP {
        return None;
    }
    let (body, _zone) = value.rsplit_once(' ')?;
    let naive = NaiveDateTime::parse_from_str(body, RFC1123_BODY).ok()?;
    u64::try_from(naive.and_utc().timestamp_millis()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_status_wire_codes() {
        assert_eq!(MemberStatus::Unavailable.code(), 0);
        assert_eq!(MemberStatus::Passive.code(), 1);
        assert_eq!(MemberStatus::Active.code(), 2);
        assert_eq!(MemberStatus::Suspicious.code(), 3);
        assert_eq!(MemberStatus::Leaving.code(), 4);
        assert_eq!(MemberStatus::from_code(5), None);
    }

    #[test]
    fn member_status_serializes_as_number() {
        let json = serde_json::to_string(&MemberStatus::Active).unwrap();
        assert_eq!(json, "2");
        let back: MemberStatus = serde_json::from_str("3").unwrap();
        assert_eq!(back, MemberStatus::Suspicious);
        assert!(serde_json::from_str::<MemberStatus>("9").is_err());
    }

    #[test]
    fn log_level_config_names_and_codes() {
        let level: LogLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
        let level: LogLevel = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
        assert_eq!(LogLevel::Error.code(), 3);
        assert_eq!(LogLevel::from_code(0), Some(LogLevel::Debug));
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(" INFO ".parse::<LogLevel>(), Ok(LogLevel::Info));
    }

    #[test]
    fn rfc1123_zero_timestamp() {
        assert_eq!(format_rfc1123(None), ZERO_TIMESTAMP);
        assert_eq!(parse_rfc1123(ZERO_TIMESTAMP), None);
        assert_eq!(parse_rfc1123(""), None);
        assert_eq!(parse_rfc1123("yesterday"), None);
    }

    #[test]
    fn rfc1123_known_instant() {
        // 2023-11-14T22:13:20Z
        let millis = 1_700_000_000_000;
        let text = format_rfc1123(Some(millis));
        assert_eq!(text, "Tue, 14 Nov 2023 22:13:20 UTC");
        assert_eq!(parse_rfc1123(&text), Some(millis));
        assert_eq!(parse_rfc1123("Tue, 14 Nov 2023 22:13:20 GMT"), Some(millis));
    }

    #[test]
    fn rfc1123_drops_sub_second_precision() {
        let text = format_rfc1123(Some(1_700_000_000_789));
        assert_eq!(parse_rfc1123(&text), Some(1_700_000_000_000));
    }
}
