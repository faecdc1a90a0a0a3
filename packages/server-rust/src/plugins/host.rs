//! Registry of loaded plugins and dispatch of their callbacks.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use pulseha_core::MemberRecord;
use tracing::{debug, info, warn};

use super::exec::LoadedPlugin;
use super::{
    GeneralPlugin, HealthCheckPlugin, NetworkingPlugin, PluginContext, PluginDescriptor,
};
use crate::error::{DaemonError, DaemonResult};

#[derive(Default)]
pub struct PluginHost {
    health_checks: RwLock<Vec<Arc<dyn HealthCheckPlugin>>>,
    networking: RwLock<Option<Arc<dyn NetworkingPlugin>>>,
    general: RwLock<Vec<Arc<dyn GeneralPlugin>>>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("health_checks", &self.health_checks.read().len())
            .field("networking", &self.networking_name())
            .field("general", &self.general.read().len())
            .finish()
    }
}

impl PluginHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_health_check(&self, plugin: Arc<dyn HealthCheckPlugin>) {
        info!(plugin = plugin.name(), version = plugin.version(), weight = plugin.weight(), "health check plugin loaded");
        self.health_checks.write().push(plugin);
    }

    /// Installs the networking back-end. Returns `false`, leaving the current
    /// one in place, if one is already loaded.
    pub fn register_networking(&self, plugin: Arc<dyn NetworkingPlugin>) -> bool {
        let mut slot = self.networking.write();
        if let Some(existing) = slot.as_ref() {
            warn!(
                loaded = existing.name(),
                rejected = plugin.name(),
                "only one networking plugin may be loaded"
            );
            return false;
        }
        info!(plugin = plugin.name(), version = plugin.version(), "networking plugin loaded");
        *slot = Some(plugin);
        true
    }

    pub fn register_general(&self, plugin: Arc<dyn GeneralPlugin>) {
        info!(plugin = plugin.name(), version = plugin.version(), "general plugin loaded");
        self.general.write().push(plugin);
    }

    /// Loads every `*.json` descriptor in `dir`. Unreadable or malformed
    /// descriptors are logged and skipped. Returns how many were loaded.
    pub fn load_dir(&self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "plugin directory not readable");
                return 0;
            }
        };
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let descriptor = match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| PluginDescriptor::from_json(&bytes).map_err(|e| e.to_string()))
                .and_then(|d| d.check().map(|()| d))
            {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping plugin");
                    continue;
                }
            };
            let accepted = match descriptor.into_plugin() {
                LoadedPlugin::HealthCheck(p) => {
                    self.register_health_check(p);
                    true
                }
                LoadedPlugin::Networking(p) => self.register_networking(p),
                LoadedPlugin::General(p) => {
                    self.register_general(p);
                    true
                }
            };
            if accepted {
                loaded += 1;
            }
        }
        loaded
    }

    #[must_use]
    pub fn health_checks(&self) -> Vec<Arc<dyn HealthCheckPlugin>> {
        self.health_checks.read().clone()
    }

    #[must_use]
    pub fn networking_name(&self) -> Option<String> {
        self.networking.read().as_ref().map(|p| p.name().to_string())
    }

    #[must_use]
    pub fn has_general(&self) -> bool {
        !self.general.read().is_empty()
    }

    fn networking(&self) -> DaemonResult<Arc<dyn NetworkingPlugin>> {
        self.networking
            .read()
            .clone()
            .ok_or(DaemonError::PluginMissing)
    }

    /// # Errors
    ///
    /// [`DaemonError::PluginMissing`] without a networking plugin, otherwise
    /// [`DaemonError::Internal`] if the plugin fails.
    pub async fn bring_up(&self, iface: &str, ips: &[String]) -> DaemonResult<()> {
        let plugin = self.networking()?;
        plugin
            .bring_up(iface, ips)
            .await
            .map_err(DaemonError::internal)
    }

    /// # Errors
    ///
    /// As [`bring_up`](Self::bring_up).
    pub async fn bring_down(&self, iface: &str, ips: &[String]) -> DaemonResult<()> {
        let plugin = self.networking()?;
        plugin
            .bring_down(iface, ips)
            .await
            .map_err(DaemonError::internal)
    }

    pub async fn notify_status_change(&self, members: &[MemberRecord]) {
        let plugins = self.general.read().clone();
        for plugin in plugins {
            plugin.on_memberlist_status_change(members).await;
        }
    }

    pub async fn notify_failover(&self, member: &MemberRecord) {
        let plugins = self.general.read().clone();
        for plugin in plugins {
            plugin.on_member_failover(member).await;
        }
    }

    /// Spawns `run` of every general plugin.
    pub fn start_general(&self, ctx: &PluginContext) {
        for plugin in self.general.read().iter() {
            let plugin = Arc::clone(plugin);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = plugin.run(ctx).await {
                    warn!(plugin = plugin.name(), error = %e, "general plugin exited with an error");
                }
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process plugins for tests.

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pulseha_core::MemberRecord;

    use super::super::{GeneralPlugin, HealthCheckPlugin, NetworkingPlugin, PluginError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum IpCall {
        Up(String, Vec<String>),
        Down(String, Vec<String>),
    }

    /// Networking back-end that records every call.
    #[derive(Debug, Default)]
    pub struct RecordingNetworking {
        calls: Mutex<Vec<IpCall>>,
    }

    impl RecordingNetworking {
        pub fn calls(&self) -> Vec<IpCall> {
            self.calls.lock().clone()
        }

        pub fn ups(&self) -> Vec<IpCall> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, IpCall::Up(..)))
                .collect()
        }
    }

    #[async_trait]
    impl NetworkingPlugin for RecordingNetworking {
        fn name(&self) -> &str {
            "recording"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        async fn bring_up(&self, iface: &str, ips: &[String]) -> Result<(), PluginError> {
            self.calls
                .lock()
                .push(IpCall::Up(iface.to_string(), ips.to_vec()));
            Ok(())
        }

        async fn bring_down(&self, iface: &str, ips: &[String]) -> Result<(), PluginError> {
            self.calls
                .lock()
                .push(IpCall::Down(iface.to_string(), ips.to_vec()));
            Ok(())
        }
    }

    /// Health check whose outcome can be flipped at runtime.
    #[derive(Debug)]
    pub struct SwitchCheck {
        pub weight: u32,
        pub healthy: AtomicBool,
    }

    impl SwitchCheck {
        pub fn new(weight: u32, healthy: bool) -> Self {
            Self {
                weight,
                healthy: AtomicBool::new(healthy),
            }
        }
    }

    #[async_trait]
    impl HealthCheckPlugin for SwitchCheck {
        fn name(&self) -> &str {
            "switch"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn weight(&self) -> u32 {
            self.weight
        }

        async fn send(&self) -> Result<(), PluginError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PluginError::Failed {
                    plugin: "switch".to_string(),
                    message: "down".to_string(),
                })
            }
        }
    }

    /// General plugin that records every membership callback.
    #[derive(Debug, Default)]
    pub struct RecordingGeneral {
        status_changes: Mutex<Vec<Vec<MemberRecord>>>,
        failovers: Mutex<Vec<MemberRecord>>,
    }

    impl RecordingGeneral {
        pub fn status_changes(&self) -> Vec<Vec<MemberRecord>> {
            self.status_changes.lock().clone()
        }

        pub fn failovers(&self) -> Vec<MemberRecord> {
            self.failovers.lock().clone()
        }
    }

    #[async_trait]
    impl GeneralPlugin for RecordingGeneral {
        fn name(&self) -> &str {
            "recording-general"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        async fn on_memberlist_status_change(&self, members: &[MemberRecord]) {
            self.status_changes.lock().push(members.to_vec());
        }

        async fn on_member_failover(&self, member: &MemberRecord) {
            self.failovers.lock().push(member.clone());
        }
    }
}
