//! Network configuration for the two listeners.

use std::net::SocketAddr;
use std::time::Duration;

use super::codec::MAX_FRAME_LEN;

/// Loopback control-plane listener.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Bind address; loopback only.
    pub addr: SocketAddr,
    /// Maximum time a control request may take, broadcasts included.
    pub request_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 49152)),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Peer-plane transport settings shared by clients and the server.
#[derive(Debug, Clone, Copy)]
pub struct PeerTransportConfig {
    /// Client-side deadline around connect, write and read.
    pub rpc_deadline: Duration,
    /// Server-side limit on the TLS handshake.
    pub handshake_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for PeerTransportConfig {
    fn default() -> Self {
        Self {
            rpc_deadline: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}
