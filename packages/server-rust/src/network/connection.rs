//! Outgoing peer connections.
//!
//! Each remote member owns one [`PeerClient`] holding at most one mutual-TLS
//! stream. Requests are strictly sequential per connection: the stream mutex
//! is held from write to read, and the whole exchange (connect included) runs
//! under the RPC deadline.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use pulseha_core::messages::{PeerReply, PeerRequest};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::codec::{framed, recv_frame, send_frame, FramedPeer};
use super::config::PeerTransportConfig;
use crate::error::{check_reply, DaemonError, DaemonResult};
use crate::security::TlsContext;

type PeerStream = FramedPeer<TlsStream<TcpStream>>;

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    Connecting,
    Ready,
    /// The last connect or request failed.
    TransientFailure,
    /// Closed for good; the member was removed.
    Shutdown,
}

impl ConnectionState {
    /// Idle and Ready count as reachable.
    #[must_use]
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Idle | Self::Ready)
    }
}

pub struct PeerClient {
    hostname: String,
    addr: SocketAddr,
    tls: Arc<TlsContext>,
    config: PeerTransportConfig,
    state: Mutex<ConnectionState>,
    stream: tokio::sync::Mutex<Option<PeerStream>>,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("hostname", &self.hostname)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerClient {
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        addr: SocketAddr,
        tls: Arc<TlsContext>,
        config: PeerTransportConfig,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            addr,
            tls,
            config,
            state: Mutex::new(ConnectionState::Idle),
            stream: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Shutdown {
            *state = next;
        }
    }

    /// Opens the connection if none is open.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Unreachable`] if the peer cannot be reached in time.
    pub async fn connect(&self) -> DaemonResult<()> {
        let mut slot = self.stream.lock().await;
        match tokio::time::timeout(self.config.rpc_deadline, self.ensure_connected(&mut slot)).await
        {
            Ok(result) => result,
            Err(_) => {
                self.set_state(ConnectionState::TransientFailure);
                Err(DaemonError::Unreachable(format!("connect to {} timed out", self.addr)))
            }
        }
    }

    async fn ensure_connected(&self, slot: &mut Option<PeerStream>) -> DaemonResult<()> {
        if slot.is_some() {
            return Ok(());
        }
        if self.state() == ConnectionState::Shutdown {
            return Err(DaemonError::Unreachable(format!("{} is closed", self.hostname)));
        }
        let Some(tls) = self.tls.client() else {
            self.set_state(ConnectionState::TransientFailure);
            return Err(DaemonError::Internal("no client certificate installed".to_string()));
        };
        self.set_state(ConnectionState::Connecting);
        match dial(self.addr, tls, self.config.max_frame_len).await {
            Ok(stream) => {
                *slot = Some(stream);
                self.set_state(ConnectionState::Ready);
                debug!(peer = %self.hostname, addr = %self.addr, "peer connection ready");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::TransientFailure);
                Err(e)
            }
        }
    }

    /// Reconnects unless already `Ready` and returns the resulting state.
    pub async fn probe(&self) -> ConnectionState {
        if self.state() != ConnectionState::Ready {
            if let Err(e) = self.connect().await {
                debug!(peer = %self.hostname, error = %e, "probe failed");
            }
        }
        self.state()
    }

    /// Sends one request and waits for its reply.
    ///
    /// Transport failures drop the connection and mark it `TransientFailure`;
    /// a failed reply envelope leaves the connection open.
    ///
    /// # Errors
    ///
    /// [`DaemonError::Unreachable`] on timeout or transport failure, otherwise
    /// the error the peer reported.
    pub async fn request(&self, request: &PeerRequest) -> DaemonResult<PeerReply> {
        let mut slot = self.stream.lock().await;
        let exchange = async {
            self.ensure_connected(&mut slot).await?;
            let stream = slot
                .as_mut()
                .ok_or_else(|| DaemonError::Unreachable("connection lost".to_string()))?;
            send_frame(stream, request).await?;
            recv_frame::<_, PeerReply>(stream)
                .await?
                .ok_or_else(|| DaemonError::Unreachable("connection closed by peer".to_string()))
        };
        let outcome = match tokio::time::timeout(self.config.rpc_deadline, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DaemonError::Unreachable(format!(
                "{} to {} timed out",
                request.name(),
                self.hostname
            ))),
        };
        match outcome {
            Ok(reply) => check_reply(reply),
            Err(e) => {
                *slot = None;
                self.set_state(ConnectionState::TransientFailure);
                Err(e)
            }
        }
    }

    /// Closes the connection permanently.
    pub async fn close(&self) {
        *self.state.lock() = ConnectionState::Shutdown;
        *self.stream.lock().await = None;
    }
}

async fn dial(
    addr: SocketAddr,
    tls: Arc<ClientConfig>,
    max_frame_len: usize,
) -> DaemonResult<PeerStream> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| DaemonError::Unreachable(format!("{addr}: {e}")))?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(%addr, error = %e, "failed to set TCP_NODELAY");
    }
    let stream = TlsConnector::from(tls)
        .connect(ServerName::IpAddress(addr.ip().into()), tcp)
        .await
        .map_err(|e| DaemonError::Unreachable(format!("tls handshake with {addr}: {e}")))?;
    Ok(framed(stream, max_frame_len))
}

/// Single request on a fresh connection, used before this node holds any
/// certificates of its own.
///
/// # Errors
///
/// As [`PeerClient::request`].
pub async fn call_once(
    addr: SocketAddr,
    tls: Arc<ClientConfig>,
    config: PeerTransportConfig,
    request: &PeerRequest,
) -> DaemonResult<PeerReply> {
    let exchange = async {
        let mut stream = dial(addr, tls, config.max_frame_len).await?;
        send_frame(&mut stream, request).await?;
        recv_frame::<_, PeerReply>(&mut stream)
            .await?
            .ok_or_else(|| DaemonError::Unreachable("connection closed by peer".to_string()))
    };
    let reply = tokio::time::timeout(config.rpc_deadline, exchange)
        .await
        .map_err(|_| DaemonError::Unreachable(format!("{} to {addr} timed out", request.name())))??;
    check_reply(reply)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulseha_core::messages::{MemberTargetPayload, PeerRequest};

    use super::*;

    fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn quick() -> PeerTransportConfig {
        PeerTransportConfig {
            rpc_deadline: Duration::from_millis(500),
            ..PeerTransportConfig::default()
        }
    }

    #[test]
    fn reachable_states() {
        assert!(ConnectionState::Idle.is_reachable());
        assert!(ConnectionState::Ready.is_reachable());
        assert!(!ConnectionState::TransientFailure.is_reachable());
        assert!(!ConnectionState::Shutdown.is_reachable());
    }

    #[tokio::test]
    async fn new_client_is_idle() {
        let client = PeerClient::new("n", unused_addr(), Arc::new(TlsContext::new()), quick());
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn request_without_certificates_fails() {
        let client = PeerClient::new("n", unused_addr(), Arc::new(TlsContext::new()), quick());
        let request = PeerRequest::Promote(MemberTargetPayload {
            member: "n".to_string(),
        });
        assert!(client.request(&request).await.is_err());
        assert_eq!(client.state(), ConnectionState::TransientFailure);
    }

    #[tokio::test]
    async fn closed_client_stays_shut_down() {
        let client = PeerClient::new("n", unused_addr(), Arc::new(TlsContext::new()), quick());
        client.close().await;
        assert_eq!(client.probe().await, ConnectionState::Shutdown);
    }
}
