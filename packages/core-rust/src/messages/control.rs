//! Loopback control-plane schemas (JSON over HTTP).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ErrorCode;
use crate::types::MemberStatus;

/// Default control-plane listen address.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:49152";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub bind_ip: String,
    pub bind_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClusterRequest {
    /// Address of any existing member.
    pub peer_ip: String,
    pub peer_port: u16,
    /// This node's own peer listener.
    pub bind_ip: String,
    pub bind_port: u16,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub action: String,
}

/// Shared body of every `group` sub-verb; unused fields are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub iface: Option<String>,
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// One line of `status` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    pub hostname: String,
    pub address: String,
    pub port: String,
    pub status: MemberStatus,
    pub latency: String,
    pub last_received: String,
    pub score: i32,
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAssignmentRow {
    pub hostname: String,
    pub iface: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupListing {
    pub groups: BTreeMap<String, Vec<String>>,
    pub assignments: Vec<GroupAssignmentRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlData {
    Token { token: String },
    Status { members: Vec<StatusRow> },
    Groups(GroupListing),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ControlData>,
}

impl ControlReply {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_code: ErrorCode::None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(message: impl Into<String>, data: ControlData) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(message)
        }
    }

    #[must_use]
    pub fn error(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_code,
            data: None,
        }
    }
}
