//! Plugins backed by external executables.
//!
//! Each `*.json` file in the plugin directory describes one plugin. The
//! `kind` tag decides which contract it implements, so a descriptor can only
//! ever be classified once.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulseha_core::MemberRecord;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{GeneralPlugin, HealthCheckPlugin, NetworkingPlugin, PluginContext, PluginError};

const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;
const NETWORKING_TIMEOUT: Duration = Duration::from_secs(30);
const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

fn default_version() -> String {
    "0.0.0".to_string()
}

const fn default_weight() -> u32 {
    1
}

/// On-disk plugin description.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginDescriptor {
    HealthCheck {
        name: String,
        #[serde(default = "default_version")]
        version: String,
        command: Vec<String>,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// The interface and then every IP are appended to the argv.
    Networking {
        name: String,
        #[serde(default = "default_version")]
        version: String,
        bring_up: Vec<String>,
        bring_down: Vec<String>,
    },
    /// Hooks receive a JSON document on stdin.
    General {
        name: String,
        #[serde(default = "default_version")]
        version: String,
        #[serde(default)]
        run: Option<Vec<String>>,
        #[serde(default)]
        on_status_change: Option<Vec<String>>,
        #[serde(default)]
        on_failover: Option<Vec<String>>,
    },
}

/// A descriptor turned into the contract it implements.
pub enum LoadedPlugin {
    HealthCheck(Arc<dyn HealthCheckPlugin>),
    Networking(Arc<dyn NetworkingPlugin>),
    General(Arc<dyn GeneralPlugin>),
}

impl PluginDescriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::HealthCheck { name, .. }
            | Self::Networking { name, .. }
            | Self::General { name, .. } => name,
        }
    }

    /// # Errors
    ///
    /// Returns the parse error for malformed JSON or an unknown `kind`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Checks that every argv the descriptor names is non-empty.
    ///
    /// # Errors
    ///
    /// Returns a description of the first empty command.
    pub fn check(&self) -> Result<(), String> {
        let empty = match self {
            Self::HealthCheck { command, .. } => command.is_empty().then_some("command"),
            Self::Networking {
                bring_up,
                bring_down,
                ..
            } => {
                if bring_up.is_empty() {
                    Some("bring_up")
                } else if bring_down.is_empty() {
                    Some("bring_down")
                } else {
                    None
                }
            }
            Self::General {
                run,
                on_status_change,
                on_failover,
                ..
            } => [("run", run), ("on_status_change", on_status_change), ("on_failover", on_failover)]
                .into_iter()
                .find(|(_, argv)| matches!(argv, Some(v) if v.is_empty()))
                .map(|(field, _)| field),
        };
        match empty {
            Some(field) => Err(format!("plugin {}: {field} must not be empty", self.name())),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn into_plugin(self) -> LoadedPlugin {
        match self {
            Self::HealthCheck {
                name,
                version,
                command,
                weight,
                timeout_ms,
            } => LoadedPlugin::HealthCheck(Arc::new(ExecHealthCheck {
                name,
                version,
                command,
                weight,
                timeout: Duration::from_millis(
                    timeout_ms.unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
                ),
            })),
            Self::Networking {
                name,
                version,
                bring_up,
                bring_down,
            } => LoadedPlugin::Networking(Arc::new(ExecNetworking {
                name,
                version,
                bring_up,
                bring_down,
            })),
            Self::General {
                name,
                version,
                run,
                on_status_change,
                on_failover,
            } => LoadedPlugin::General(Arc::new(ExecGeneral {
                name,
                version,
                run,
                on_status_change,
                on_failover,
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Process runner
// ---------------------------------------------------------------------------

async fn run_command(
    plugin: &str,
    argv: &[String],
    extra: &[String],
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<(), PluginError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(PluginError::Spawn {
            plugin: plugin.to_string(),
            message: "empty command".to_string(),
        });
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .args(extra)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| PluginError::Spawn {
        plugin: plugin.to_string(),
        message: e.to_string(),
    })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(&input).await {
            debug!(plugin, error = %e, "plugin closed stdin early");
        }
    }

    let output = child.wait_with_output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, output)
            .await
            .map_err(|_| PluginError::TimedOut {
                plugin: plugin.to_string(),
            })?,
        None => output.await,
    }
    .map_err(|e| PluginError::Failed {
        plugin: plugin.to_string(),
        message: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PluginError::Failed {
            plugin: plugin.to_string(),
            message: format!("{} {}", output.status, stderr.trim()),
        })
    }
}

// ---------------------------------------------------------------------------
// Contract implementations
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExecHealthCheck {
    name: String,
    version: String,
    command: Vec<String>,
    weight: u32,
    timeout: Duration,
}

#[async_trait]
impl HealthCheckPlugin for ExecHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    async fn send(&self) -> Result<(), PluginError> {
        run_command(&self.name, &self.command, &[], None, Some(self.timeout)).await
    }
}

#[derive(Debug)]
pub struct ExecNetworking {
    name: String,
    version: String,
    bring_up: Vec<String>,
    bring_down: Vec<String>,
}

fn ip_args(iface: &str, ips: &[String]) -> Vec<String> {
    std::iter::once(iface.to_string())
        .chain(ips.iter().cloned())
        .collect()
}

#[async_trait]
impl NetworkingPlugin for ExecNetworking {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn bring_up(&self, iface: &str, ips: &[String]) -> Result<(), PluginError> {
        run_command(
            &self.name,
            &self.bring_up,
            &ip_args(iface, ips),
            None,
            Some(NETWORKING_TIMEOUT),
        )
        .await
    }

    async fn bring_down(&self, iface: &str, ips: &[String]) -> Result<(), PluginError> {
        run_command(
            &self.name,
            &self.bring_down,
            &ip_args(iface, ips),
            None,
            Some(NETWORKING_TIMEOUT),
        )
        .await
    }
}

#[derive(Debug)]
pub struct ExecGeneral {
    name: String,
    version: String,
    run: Option<Vec<String>>,
    on_status_change: Option<Vec<String>>,
    on_failover: Option<Vec<String>>,
}

impl ExecGeneral {
    async fn hook(&self, argv: Option<&Vec<String>>, body: Result<Vec<u8>, serde_json::Error>) {
        let Some(argv) = argv else { return };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(plugin = %self.name, error = %e, "failed to encode hook input");
                return;
            }
        };
        if let Err(e) = run_command(&self.name, argv, &[], Some(body), Some(HOOK_TIMEOUT)).await {
            warn!(plugin = %self.name, error = %e, "plugin hook failed");
        }
    }
}

#[async_trait]
impl GeneralPlugin for ExecGeneral {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn run(&self, ctx: PluginContext) -> Result<(), PluginError> {
        let Some(argv) = &self.run else {
            return Ok(());
        };
        let body = serde_json::to_vec(&serde_json::json!({
            "hostname": ctx.hostname,
            "config": ctx.config,
        }))
        .map_err(|e| PluginError::Failed {
            plugin: self.name.clone(),
            message: e.to_string(),
        })?;
        run_command(&self.name, argv, &[], Some(body), None).await
    }

    async fn on_memberlist_status_change(&self, members: &[MemberRecord]) {
        self.hook(self.on_status_change.as_ref(), serde_json::to_vec(members))
            .await;
    }

    async fn on_member_failover(&self, member: &MemberRecord) {
        self.hook(self.on_failover.as_ref(), serde_json::to_vec(member))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulseha_core::{MemberStatus, ZERO_TIMESTAMP};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn descriptor_kind_selects_the_contract() {
        let json = br#"{"kind":"health_check","name":"ping","command":["true"],"weight":3}"#;
        let descriptor = PluginDescriptor::from_json(json).unwrap();
        assert_eq!(descriptor.name(), "ping");
        assert!(matches!(descriptor.into_plugin(), LoadedPlugin::HealthCheck(p) if p.weight() == 3));

        let json = br#"{"kind":"networking","name":"netlink","bring_up":["up"],"bring_down":["down"]}"#;
        let descriptor = PluginDescriptor::from_json(json).unwrap();
        assert!(matches!(descriptor.into_plugin(), LoadedPlugin::Networking(p) if p.version() == "0.0.0"));
    }

    #[test]
    fn negative_health_check_weight_is_rejected() {
        let json = br#"{"kind":"health_check","name":"ping","command":["true"],"weight":-5}"#;
        assert!(PluginDescriptor::from_json(json).is_err());

        let json = br#"{"kind":"health_check","name":"ping","command":["true"]}"#;
        let descriptor = PluginDescriptor::from_json(json).unwrap();
        assert!(matches!(descriptor.into_plugin(), LoadedPlugin::HealthCheck(p) if p.weight() == 1));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = br#"{"kind":"serial","name":"tty"}"#;
        assert!(PluginDescriptor::from_json(json).is_err());
    }

    #[test]
    fn empty_commands_fail_the_check() {
        let descriptor = PluginDescriptor::HealthCheck {
            name: "x".to_string(),
            version: default_version(),
            command: Vec::new(),
            weight: 1,
            timeout_ms: None,
        };
        assert!(descriptor.check().is_err());

        let descriptor = PluginDescriptor::General {
            name: "g".to_string(),
            version: default_version(),
            run: None,
            on_status_change: Some(Vec::new()),
            on_failover: None,
        };
        assert!(descriptor.check().unwrap_err().contains("on_status_change"));
    }

    #[tokio::test]
    async fn exit_status_decides_health() {
        let passing = ExecHealthCheck {
            name: "ok".to_string(),
            version: default_version(),
            command: argv(&["true"]),
            weight: 2,
            timeout: Duration::from_secs(5),
        };
        assert!(passing.send().await.is_ok());

        let failing = ExecHealthCheck {
            command: argv(&["false"]),
            ..passing
        };
        assert!(matches!(failing.send().await, Err(PluginError::Failed { .. })));
    }

    #[tokio::test]
    async fn slow_checks_time_out() {
        let slow = ExecHealthCheck {
            name: "slow".to_string(),
            version: default_version(),
            command: argv(&["sleep", "5"]),
            weight: 1,
            timeout: Duration::from_millis(50),
        };
        assert!(matches!(slow.send().await, Err(PluginError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_command("x", &argv(&["/nonexistent/pulseha-plugin"]), &[], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Spawn { .. }));
    }

    #[tokio::test]
    async fn networking_appends_iface_and_ips() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = format!("echo \"$@\" > {}", out.display());
        let plugin = ExecNetworking {
            name: "rec".to_string(),
            version: default_version(),
            bring_up: argv(&["sh", "-c", &script, "sh"]),
            bring_down: argv(&["true"]),
        };
        plugin
            .bring_up("eth0", &argv(&["192.0.2.10/24", "192.0.2.11/24"]))
            .await
            .unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "eth0 192.0.2.10/24 192.0.2.11/24");
    }

    #[tokio::test]
    async fn failover_hook_receives_the_member_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("member.json");
        let script = format!("cat > {}", out.display());
        let plugin = ExecGeneral {
            name: "hook".to_string(),
            version: default_version(),
            run: None,
            on_status_change: None,
            on_failover: Some(argv(&["sh", "-c", &script])),
        };
        let record = MemberRecord {
            hostname: "node-2".to_string(),
            status: MemberStatus::Active,
            latency: String::new(),
            last_received: ZERO_TIMESTAMP.to_string(),
            score: 0,
        };
        plugin.on_member_failover(&record).await;
        let written: MemberRecord =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written, record);
    }
}
