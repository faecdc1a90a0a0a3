//! Cluster-facing mutual-TLS RPC server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use pulseha_core::messages::{ErrorCode, PeerReply, PeerRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{framed, recv_frame, send_frame};
use super::config::PeerTransportConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::security::TlsContext;

/// Serves decoded peer requests.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle(&self, request: PeerRequest, remote: SocketAddr) -> PeerReply;
}

/// A bound peer listener that has not started accepting yet.
pub struct PeerServer {
    listener: TcpListener,
    tls: Arc<TlsContext>,
    handler: Arc<dyn PeerHandler>,
    config: PeerTransportConfig,
}

impl PeerServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Internal`] if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<TlsContext>,
        handler: Arc<dyn PeerHandler>,
        config: PeerTransportConfig,
    ) -> DaemonResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DaemonError::Internal(format!("cannot bind peer listener {addr}: {e}")))?;
        Ok(Self {
            listener,
            tls,
            handler,
            config,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> DaemonResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) {
        let addr = self.listener.local_addr().ok();
        info!(?addr, "peer listener accepting");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, remote)) => {
                        let tls = Arc::clone(&self.tls);
                        let handler = Arc::clone(&self.handler);
                        let token = shutdown.child_token();
                        let config = self.config;
                        tokio::spawn(async move {
                            serve_connection(tcp, remote, tls, handler, config, token).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "peer accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
            }
        }
        info!(?addr, "peer listener stopped");
    }

    /// Spawns [`serve`](Self::serve) and returns a handle that stops it.
    #[must_use]
    pub fn spawn(self) -> PeerServerHandle {
        let token = CancellationToken::new();
        let addr = self.listener.local_addr().ok();
        let task = tokio::spawn(self.serve(token.clone()));
        PeerServerHandle { addr, token, task }
    }
}

/// Running peer listener.
#[derive(Debug)]
pub struct PeerServerHandle {
    addr: Option<SocketAddr>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stops accepting and closes open connections.
    pub fn stop(self) {
        self.token.cancel();
        self.task.abort();
    }
}

async fn serve_connection(
    tcp: TcpStream,
    remote: SocketAddr,
    tls: Arc<TlsContext>,
    handler: Arc<dyn PeerHandler>,
    config: PeerTransportConfig,
    shutdown: CancellationToken,
) {
    let Some(server_config) = tls.server() else {
        warn!(%remote, "peer connection refused: no server certificate installed");
        return;
    };
    let stream = match tokio::time::timeout(
        config.handshake_timeout,
        TlsAcceptor::from(server_config).accept(tcp),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%remote, error = %e, "tls handshake failed");
            return;
        }
        Err(_) => {
            debug!(%remote, "tls handshake timed out");
            return;
        }
    };
    let authenticated = stream
        .get_ref()
        .1
        .peer_certificates()
        .is_some_and(|certs| !certs.is_empty());
    let mut stream = framed(stream, config.max_frame_len);

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = recv_frame::<_, PeerRequest>(&mut stream) => next,
        };
        let request = match next {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!(%remote, error = %e, "dropping peer connection");
                break;
            }
        };
        let reply = if request.requires_client_cert() && !authenticated {
            warn!(%remote, rpc = request.name(), "rejected request without client certificate");
            PeerReply::error(ErrorCode::Unauthorized, "client certificate required")
        } else {
            handler.handle(request, remote).await
        };
        if let Err(e) = send_frame(&mut stream, &reply).await {
            debug!(%remote, error = %e, "failed to write reply");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pulseha_core::messages::{JoinPayload, MemberTargetPayload};
    use pulseha_core::Node;

    use super::*;
    use crate::network::connection::{call_once, ConnectionState, PeerClient};
    use crate::security::{tls, Identity, MemoryCertStore};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerHandler for Echo {
        async fn handle(&self, request: PeerRequest, _remote: SocketAddr) -> PeerReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PeerReply {
                message: request.name().to_string(),
                ..PeerReply::ok()
            }
        }
    }

    fn loopback() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn issued_context(identity: &Identity) -> Arc<TlsContext> {
        identity.issue_leaves(loopback()).unwrap();
        let ctx = Arc::new(TlsContext::new());
        identity.load_into(&ctx).unwrap();
        ctx
    }

    async fn start(ctx: Arc<TlsContext>, handler: Arc<Echo>) -> (SocketAddr, PeerServerHandle) {
        let server = PeerServer::bind(
            SocketAddr::new(loopback(), 0),
            ctx,
            handler,
            PeerTransportConfig::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        (addr, server.spawn())
    }

    fn promote() -> PeerRequest {
        PeerRequest::Promote(MemberTargetPayload {
            member: "n".to_string(),
        })
    }

    #[tokio::test]
    async fn mutual_tls_request_round_trip() {
        let identity = Identity::new(Arc::new(MemoryCertStore::default()));
        identity.create_ca(loopback()).unwrap();
        let ctx = issued_context(&identity);
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (addr, handle) = start(ctx.clone(), handler.clone()).await;

        let client = PeerClient::new("n", addr, ctx, PeerTransportConfig::default());
        assert_eq!(client.probe().await, ConnectionState::Ready);
        let reply = client.request(&promote()).await.unwrap();
        assert_eq!(reply.message, "promote");
        let reply = client.request(&promote()).await.unwrap();
        assert!(reply.success);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        handle.stop();
    }

    #[tokio::test]
    async fn unauthenticated_client_only_reaches_join() {
        let identity = Identity::new(Arc::new(MemoryCertStore::default()));
        identity.create_ca(loopback()).unwrap();
        let ctx = issued_context(&identity);
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (addr, handle) = start(ctx, handler.clone()).await;
        let bootstrap = Arc::new(tls::bootstrap_client_config().unwrap());
        let config = PeerTransportConfig::default();

        let err = call_once(addr, bootstrap.clone(), config, &promote())
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Unauthorized(_)));

        let join = PeerRequest::Join(JoinPayload {
            uid: "u".to_string(),
            hostname: "joiner".to_string(),
            ip: "127.0.0.1".to_string(),
            port: "1".to_string(),
            token: "t".to_string(),
            node: Node::new("joiner", "127.0.0.1", 1),
        });
        let reply = call_once(addr, bootstrap, config, &join).await.unwrap();
        assert_eq!(reply.message, "join");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        handle.stop();
    }

    #[tokio::test]
    async fn foreign_ca_cannot_connect() {
        let ours = Identity::new(Arc::new(MemoryCertStore::default()));
        ours.create_ca(loopback()).unwrap();
        let theirs = Identity::new(Arc::new(MemoryCertStore::default()));
        theirs.create_ca(loopback()).unwrap();

        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (addr, handle) = start(issued_context(&ours), handler.clone()).await;

        let config = PeerTransportConfig {
            rpc_deadline: Duration::from_secs(2),
            ..PeerTransportConfig::default()
        };
        let client = PeerClient::new("n", addr, issued_context(&theirs), config);
        assert!(client.request(&promote()).await.is_err());
        assert_eq!(client.state(), ConnectionState::TransientFailure);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        handle.stop();
    }

    #[tokio::test]
    async fn stopped_server_is_unreachable() {
        let identity = Identity::new(Arc::new(MemoryCertStore::default()));
        identity.create_ca(loopback()).unwrap();
        let ctx = issued_context(&identity);
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (addr, handle) = start(ctx.clone(), handler).await;
        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = PeerClient::new("n", addr, ctx, PeerTransportConfig::default());
        assert_eq!(client.probe().await, ConnectionState::TransientFailure);
    }
}
