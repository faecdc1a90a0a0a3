//! Plugin contracts and the host that dispatches to them.
//!
//! Three contracts exist and an artefact implements exactly one:
//!
//! - [`HealthCheckPlugin`]: contributes its weight to the local score when
//!   its check passes.
//! - [`NetworkingPlugin`]: brings floating IPs up and down. At most one is
//!   loaded; without it the daemon only monitors.
//! - [`GeneralPlugin`]: runs once at start and observes membership changes.

pub mod exec;
pub mod host;

pub use exec::PluginDescriptor;
pub use host::PluginHost;

use async_trait::async_trait;
use pulseha_core::{ClusterConfig, MemberRecord};

/// Failure reported by a plugin call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("plugin {plugin} failed: {message}")]
    Failed { plugin: String, message: String },
    #[error("plugin {plugin} timed out")]
    TimedOut { plugin: String },
    #[error("plugin {plugin} could not be started: {message}")]
    Spawn { plugin: String, message: String },
}

#[async_trait]
pub trait HealthCheckPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    /// Added to the local score when [`send`](Self::send) succeeds.
    fn weight(&self) -> u32;
    async fn send(&self) -> Result<(), PluginError>;
}

#[async_trait]
pub trait NetworkingPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    async fn bring_up(&self, iface: &str, ips: &[String]) -> Result<(), PluginError>;
    async fn bring_down(&self, iface: &str, ips: &[String]) -> Result<(), PluginError>;
}

/// What a general plugin sees when it starts.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub hostname: String,
    pub config: ClusterConfig,
}

#[async_trait]
pub trait GeneralPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Invoked once, in its own task, when the daemon starts.
    async fn run(&self, _ctx: PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_memberlist_status_change(&self, _members: &[MemberRecord]) {}

    async fn on_member_failover(&self, _member: &MemberRecord) {}
}
