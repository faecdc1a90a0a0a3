//! Control-plane listener with deferred startup.
//!
//! `new()` assembles the router state, `start()` binds the loopback
//! listener, and `serve()` accepts operator requests until shutdown. Binding
//! before serving lets the binary fail fast when the port is taken.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::ControlConfig;
use super::handlers::{
    config_handler, create_handler, group_add_handler, group_assign_handler, group_delete_handler,
    group_list_handler, group_new_handler, group_remove_handler, group_unassign_handler,
    health_handler, join_handler, leave_handler, liveness_handler, network_handler,
    promote_handler, reload_handler, remove_handler, status_handler, tls_handler, token_handler,
    AppState,
};
use super::middleware::build_control_layers;
use super::shutdown::DaemonPhase;
use crate::service::Daemon;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the operator-facing HTTP listener.
pub struct ControlModule {
    config: ControlConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl ControlModule {
    #[must_use]
    pub fn new(config: ControlConfig, daemon: Arc<Daemon>) -> Self {
        Self {
            config,
            listener: None,
            state: AppState::new(daemon),
        }
    }

    /// Assembles the router with every verb route and the middleware stack.
    ///
    /// Routes:
    /// - `POST /v1/{create,join,leave,remove,promote,token,tls,config,network,reload}`
    /// - `POST /v1/group/{new,delete,add,remove,assign,unassign}`
    /// - `GET /v1/group/list`, `GET /v1/status`
    /// - `GET /v1/health`, `GET /v1/health/live`
    pub fn build_router(&self) -> Router {
        let verbs = Router::new()
            .route("/v1/create", post(create_handler))
            .route("/v1/join", post(join_handler))
            .route("/v1/leave", post(leave_handler))
            .route("/v1/remove", post(remove_handler))
            .route("/v1/promote", post(promote_handler))
            .route("/v1/token", post(token_handler))
            .route("/v1/tls", post(tls_handler))
            .route("/v1/config", post(config_handler))
            .route("/v1/network", post(network_handler))
            .route("/v1/reload", post(reload_handler))
            .route("/v1/status", get(status_handler))
            .route("/v1/group/new", post(group_new_handler))
            .route("/v1/group/delete", post(group_delete_handler))
            .route("/v1/group/add", post(group_add_handler))
            .route("/v1/group/remove", post(group_remove_handler))
            .route("/v1/group/assign", post(group_assign_handler))
            .route("/v1/group/unassign", post(group_unassign_handler))
            .route("/v1/group/list", get(group_list_handler))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                track_in_flight,
            ));

        Router::new()
            .merge(verbs)
            .route("/v1/health", get(health_handler))
            .route("/v1/health/live", get(liveness_handler))
            .layer(build_control_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "control listener bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serves operator requests until `shutdown` resolves, then waits for
    /// in-flight verbs to finish.
    ///
    /// # Errors
    ///
    /// Fails if [`start`](Self::start) was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("control listener not bound; call start() first"))?;
        let router = self.build_router();
        let controller = Arc::clone(&self.state.shutdown);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(DRAIN_TIMEOUT).await {
            info!("control requests drained");
        } else {
            warn!("drain timeout expired with control requests in flight");
        }
        Ok(())
    }
}

/// Counts the request as in flight; refuses new verbs once draining.
async fn track_in_flight(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if matches!(
        state.shutdown.phase(),
        DaemonPhase::Draining | DaemonPhase::Stopped
    ) {
        return (StatusCode::SERVICE_UNAVAILABLE, "daemon is shutting down").into_response();
    }
    let _guard = state.shutdown.in_flight_guard();
    next.run(request).await
}
