//! Inter-node RPC schemas.
//!
//! Every request is one [`PeerRequest`] frame answered by exactly one
//! [`PeerReply`] frame on the same connection.

use serde::{Deserialize, Serialize};

use super::ErrorCode;
use crate::config::{ClusterConfig, Node};
use crate::types::{LogLevel, MemberRecord};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Member-list snapshot sent by the active node on every heart-beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPayload {
    pub members: Vec<MemberRecord>,
}

/// A node asking to be admitted to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub uid: String,
    pub hostname: String,
    pub ip: String,
    pub port: String,
    /// Cleartext cluster token.
    pub token: String,
    pub node: Node,
}

/// Target of a `Leave` or `Remove` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub hostname: String,
    /// Set on broadcast copies; receivers never re-forward.
    #[serde(default)]
    pub replicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSyncPayload {
    pub config: ClusterConfig,
    #[serde(default)]
    pub replicated: bool,
}

/// `Promote` / `MakePassive`: the recipient must be `member`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTargetPayload {
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBatchPayload {
    pub iface: String,
    pub ips: Vec<String>,
}

/// One relayed log line. The level travels as its numeric code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsPayload {
    pub node: String,
    #[serde(with = "level_code")]
    pub level: LogLevel,
    pub message: String,
}

mod level_code {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::LogLevel;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(level: &LogLevel, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(level.code())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LogLevel, D::Error> {
        let code = u8::deserialize(deserializer)?;
        LogLevel::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown log level {code}")))
    }
}

// ---------------------------------------------------------------------------
// PeerRequest
// ---------------------------------------------------------------------------

/// The inter-node protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerRequest {
    HealthCheck(HealthCheckPayload),
    Join(JoinPayload),
    Leave(LeavePayload),
    Remove(LeavePayload),
    ConfigSync(ConfigSyncPayload),
    Promote(MemberTargetPayload),
    MakePassive(MemberTargetPayload),
    BringUpIp(IpBatchPayload),
    BringDownIp(IpBatchPayload),
    Logs(LogsPayload),
}

impl PeerRequest {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HealthCheck(_) => "health_check",
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Remove(_) => "remove",
            Self::ConfigSync(_) => "config_sync",
            Self::Promote(_) => "promote",
            Self::MakePassive(_) => "make_passive",
            Self::BringUpIp(_) => "bring_up_ip",
            Self::BringDownIp(_) => "bring_down_ip",
            Self::Logs(_) => "logs",
        }
    }

    /// `Join` is the only request served without a client certificate.
    #[must_use]
    pub const fn requires_client_cert(&self) -> bool {
        !matches!(self, Self::Join(_))
    }
}

// ---------------------------------------------------------------------------
// PeerReply
// ---------------------------------------------------------------------------

/// Returned to a node whose join was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAccepted {
    pub config: ClusterConfig,
    /// PEM encoded CA certificate.
    pub ca_crt: String,
    /// PEM encoded CA private key.
    pub ca_key: String,
}

/// Request-specific reply data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyBody {
    HealthCheck { score: i32 },
    Join(JoinAccepted),
}

/// Reply envelope shared by every peer RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_code: ErrorCode,
    #[serde(default)]
    pub body: Option<ReplyBody>,
}

impl PeerReply {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
            error_code: ErrorCode::None,
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(body: ReplyBody) -> Self {
        Self {
            body: Some(body),
            ..Self::ok()
        }
    }

    #[must_use]
    pub fn error(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_code,
            body: None,
        }
    }
}
