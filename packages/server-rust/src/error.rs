//! Daemon error taxonomy and its mapping onto wire error codes.

use std::fmt::Display;

use pulseha_core::messages::{CodecError, ControlReply, ErrorCode, PeerReply};
use pulseha_core::ConfigError;

/// Every failure the daemon reports to an operator or a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("not in a configured cluster")]
    NotInCluster,
    #[error("already in a configured cluster")]
    AlreadyInCluster,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid cluster token")]
    InvalidToken,
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no networking plugin loaded")]
    PluginMissing,
    #[error("missing CA material: {0}")]
    MissingCa(String),
    #[error("{0} cannot be changed with a config update")]
    ReadOnlyKey(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

impl DaemonError {
    pub fn internal(err: impl Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn unreachable(err: impl Display) -> Self {
        Self::Unreachable(err.to_string())
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ConfigInvalid(_) => ErrorCode::ConfigInvalid,
            Self::NotInCluster => ErrorCode::NotInCluster,
            Self::AlreadyInCluster => ErrorCode::AlreadyInCluster,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::InvalidToken => ErrorCode::InvalidToken,
            Self::Unreachable(_) => ErrorCode::Unreachable,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::PluginMissing => ErrorCode::PluginMissing,
            Self::MissingCa(_) => ErrorCode::MissingCa,
            Self::ReadOnlyKey(_) => ErrorCode::ReadOnlyKey,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Rebuilds the error a remote side reported in a failed envelope.
    #[must_use]
    pub fn from_reply(code: ErrorCode, message: &str) -> Self {
        let message = message.to_string();
        match code {
            ErrorCode::ConfigInvalid => Self::ConfigInvalid(message),
            ErrorCode::NotInCluster => Self::NotInCluster,
            ErrorCode::AlreadyInCluster => Self::AlreadyInCluster,
            ErrorCode::Unauthorized => Self::Unauthorized(message),
            ErrorCode::InvalidToken => Self::InvalidToken,
            ErrorCode::Unreachable => Self::Unreachable(message),
            ErrorCode::Conflict => Self::Conflict(message),
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::PluginMissing => Self::PluginMissing,
            ErrorCode::MissingCa => Self::MissingCa(message),
            ErrorCode::ReadOnlyKey => Self::ReadOnlyKey(message),
            ErrorCode::None | ErrorCode::Internal => Self::Internal(message),
        }
    }

    #[must_use]
    pub fn to_peer_reply(&self) -> PeerReply {
        PeerReply::error(self.code(), self.to_string())
    }

    #[must_use]
    pub fn to_control_reply(&self) -> ControlReply {
        ControlReply::error(self.code(), self.to_string())
    }
}

impl From<ConfigError> for DaemonError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}

impl From<CodecError> for DaemonError {
    fn from(err: CodecError) -> Self {
        Self::internal(err)
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err)
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(err)
    }
}

/// Turns a failed peer reply into an error; successful replies pass through.
///
/// # Errors
///
/// Returns the [`DaemonError`] matching the reply's error code.
pub fn check_reply(reply: PeerReply) -> DaemonResult<PeerReply> {
    if reply.success {
        Ok(reply)
    } else {
        Err(DaemonError::from_reply(reply.error_code, &reply.message))
    }
}
