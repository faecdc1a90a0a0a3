//! `PulseHA` daemon.
//!
//! Loads the cluster document, rejoins the configured cluster (if any),
//! serves the loopback control plane, and runs until SIGINT/SIGTERM or until
//! another member removes this node.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use pulseha_server::config::{
    DaemonSettings, DEFAULT_CERT_DIR, DEFAULT_CONFIG_PATH, DEFAULT_PLUGIN_DIR,
};
use pulseha_server::logging::init_tracing;
use pulseha_server::network::{ControlConfig, ControlModule};
use pulseha_server::Daemon;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pulseha")]
#[command(about = "Active/passive high-availability cluster daemon")]
#[command(version)]
struct Cli {
    /// Cluster configuration document
    #[arg(long, env = "PULSEHA_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory holding ca/server/client certificates
    #[arg(long, env = "PULSEHA_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    cert_dir: PathBuf,

    /// Directory scanned for plugin descriptors
    #[arg(long, env = "PULSEHA_PLUGIN_DIR", default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,

    /// Loopback address of the control plane
    #[arg(long, env = "PULSEHA_CONTROL_ADDR", default_value = "127.0.0.1:49152")]
    control_addr: SocketAddr,

    /// Deadline for each peer RPC, in milliseconds
    #[arg(long, env = "PULSEHA_RPC_DEADLINE_MS", default_value_t = 5000)]
    rpc_deadline_ms: u64,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn settings(&self) -> DaemonSettings {
        DaemonSettings {
            config_path: self.config.clone(),
            cert_dir: self.cert_dir.clone(),
            plugin_dir: self.plugin_dir.clone(),
            control_addr: self.control_addr,
            rpc_deadline: Duration::from_millis(self.rpc_deadline_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings();

    let daemon = Daemon::from_settings(settings.clone())?;
    let tunables = daemon.config().settings();
    let log_file = tunables
        .log_to_file
        .then(|| Path::new(&tunables.log_file_location).to_path_buf());
    init_tracing(tunables.logging_level, log_file.as_deref(), cli.log_json)?;
    daemon.load_plugins();
    info!(
        config = %settings.config_path.display(),
        plugins = ?daemon.plugins().networking_name(),
        "PulseHA starting"
    );

    let mut control = ControlModule::new(
        ControlConfig {
            addr: settings.control_addr,
            ..ControlConfig::default()
        },
        daemon.clone(),
    );
    control.start().await?;

    daemon.start().await?;
    info!(hostname = %daemon.hostname(), "daemon running");

    let controller = daemon.shutdown_controller();
    let stop = {
        let controller = controller.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => info!("signal received; shutting down"),
                () = controller.wait_for_trigger() => info!("shutdown requested"),
            }
        }
    };
    if let Err(e) = control.serve(stop).await {
        error!(error = %e, "control listener failed");
    }

    daemon.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
