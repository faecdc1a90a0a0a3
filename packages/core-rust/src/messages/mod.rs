//! Wire schemas for the two RPC planes.
//!
//! - [`peer`]: the inter-node protocol carried over mutual TLS as
//!   length-prefixed named `MsgPack` frames (`rmp_serde::to_vec_named()`).
//! - [`control`]: the loopback administrative protocol carried as JSON.
//!
//! Both planes answer with the same `{success, message, error_code}` envelope.

pub mod control;
pub mod peer;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use control::{
    ConfigUpdateRequest, ControlData, ControlReply, CreateRequest, GroupAssignmentRow,
    GroupListing, GroupRequest, JoinClusterRequest, NetworkRequest, PromoteRequest,
    RemoveRequest, StatusRow, DEFAULT_CONTROL_ADDR,
};
pub use peer::{
    ConfigSyncPayload, HealthCheckPayload, IpBatchPayload, JoinAccepted, JoinPayload,
    LeavePayload, LogsPayload, MemberTargetPayload, PeerReply, PeerRequest, ReplyBody,
};

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Stable numeric error codes carried in every reply envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    None,
    ConfigInvalid,
    NotInCluster,
    AlreadyInCluster,
    Unauthorized,
    Unreachable,
    Conflict,
    NotFound,
    PluginMissing,
    InvalidToken,
    Internal,
    ReadOnlyKey,
    MissingCa,
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::None => 0,
            Self::ConfigInvalid => 1,
            Self::NotInCluster => 2,
            Self::AlreadyInCluster => 3,
            Self::Unauthorized => 4,
            Self::Unreachable => 5,
            Self::Conflict => 6,
            Self::NotFound => 7,
            Self::PluginMissing => 8,
            Self::InvalidToken => 9,
            Self::Internal => 10,
            Self::ReadOnlyKey => 11,
            Self::MissingCa => 12,
        }
    }

    /// Maps a numeric code back; unknown codes become [`ErrorCode::Internal`].
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            0 => Self::None,
            1 => Self::ConfigInvalid,
            2 => Self::NotInCluster,
            3 => Self::AlreadyInCluster,
            4 => Self::Unauthorized,
            5 => Self::Unreachable,
            6 => Self::Conflict,
            7 => Self::NotFound,
            8 => Self::PluginMissing,
            9 => Self::InvalidToken,
            11 => Self::ReadOnlyKey,
            12 => Self::MissingCa,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_code(u16::deserialize(deserializer)?))
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Failure to encode or decode a wire message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serializes a value as named `MsgPack`.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserializes a named `MsgPack` value.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not a valid `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::None.code(), 0);
        assert_eq!(ErrorCode::InvalidToken.code(), 9);
        assert_eq!(ErrorCode::from_code(9), ErrorCode::InvalidToken);
        assert_eq!(ErrorCode::from_code(999), ErrorCode::Internal);
        for code in 0..=12 {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn error_code_serializes_as_integer() {
        let json = serde_json::to_string(&ErrorCode::Conflict).unwrap();
        assert_eq!(json, "6");
    }
}
