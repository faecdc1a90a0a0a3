//! Peer transport, control-plane listener, and shutdown control.

pub mod codec;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod peer_server;
pub mod shutdown;

pub use config::{ControlConfig, PeerTransportConfig};
pub use connection::{call_once, ConnectionState, PeerClient};
pub use handlers::AppState;
pub use module::ControlModule;
pub use peer_server::{PeerHandler, PeerServer, PeerServerHandle};
pub use shutdown::{DaemonPhase, InFlightGuard, ShutdownController};
