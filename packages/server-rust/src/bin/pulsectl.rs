//! `pulsectl`: operator CLI for the local `PulseHA` daemon.
//!
//! Every sub-command is one request to the loopback control plane. The exit
//! status is 0 when the daemon accepted the verb and 1 otherwise.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pulseha_core::messages::{
    ConfigUpdateRequest, ControlData, ControlReply, CreateRequest, GroupListing, GroupRequest,
    JoinClusterRequest, NetworkRequest, PromoteRequest, RemoveRequest, StatusRow,
    DEFAULT_CONTROL_ADDR,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "pulsectl")]
#[command(about = "Control the local PulseHA daemon")]
#[command(version)]
struct Cli {
    /// Control-plane address of the daemon
    #[arg(long, env = "PULSECTL_ADDR", default_value = DEFAULT_CONTROL_ADDR)]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new cluster with this node as its only member
    Create {
        #[arg(long)]
        bind_ip: String,
        #[arg(long)]
        bind_port: u16,
    },
    /// Join an existing cluster through any of its members
    Join {
        peer_ip: String,
        peer_port: u16,
        #[arg(long)]
        bind_ip: String,
        #[arg(long)]
        bind_port: u16,
        #[arg(long)]
        token: String,
    },
    /// Leave the cluster, handing over floating IPs if active
    Leave,
    /// Remove another member from the cluster
    Remove { hostname: String },
    /// Make a member the active node
    Promote { hostname: String },
    /// Show every member's status
    Status,
    /// Generate a new cluster join token
    Token,
    /// Re-issue this node's certificates from the cluster CA
    Tls,
    /// Change a tunable and replicate it
    Config { key: String, value: String },
    /// Network maintenance (`resync`)
    Network { action: String },
    /// Re-read the configuration document from disk
    Reload,
    /// Floating IP groups
    #[command(subcommand)]
    Group(GroupCommand),
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    /// Create a group; a name is generated when omitted
    New { name: Option<String> },
    Delete { name: String },
    /// Add CIDR addresses to a group
    Add {
        name: String,
        #[arg(required = true)]
        ips: Vec<String>,
    },
    /// Remove addresses from a group
    Remove {
        name: String,
        #[arg(required = true)]
        ips: Vec<String>,
    },
    /// Assign a group to an interface on a node (default: this node)
    Assign {
        name: String,
        iface: String,
        #[arg(long)]
        node: Option<String>,
    },
    Unassign {
        name: String,
        iface: String,
        #[arg(long)]
        node: Option<String>,
    },
    List,
}

enum Method {
    Get,
    Post,
}

struct Call {
    method: Method,
    path: &'static str,
    body: Option<serde_json::Value>,
}

impl Call {
    fn get(path: &'static str) -> Self {
        Self {
            method: Method::Get,
            path,
            body: None,
        }
    }

    fn post(path: &'static str) -> Self {
        Self {
            method: Method::Post,
            path,
            body: None,
        }
    }

    fn post_json(path: &'static str, body: &impl Serialize) -> anyhow::Result<Self> {
        Ok(Self {
            body: Some(serde_json::to_value(body)?),
            ..Self::post(path)
        })
    }
}

fn group(name: Option<String>) -> GroupRequest {
    GroupRequest {
        name,
        ..GroupRequest::default()
    }
}

impl Command {
    fn into_call(self) -> anyhow::Result<Call> {
        let call = match self {
            Self::Create { bind_ip, bind_port } => {
                Call::post_json("/v1/create", &CreateRequest { bind_ip, bind_port })?
            }
            Self::Join {
                peer_ip,
                peer_port,
                bind_ip,
                bind_port,
                token,
            } => Call::post_json(
                "/v1/join",
                &JoinClusterRequest {
                    peer_ip,
                    peer_port,
                    bind_ip,
                    bind_port,
                    token,
                },
            )?,
            Self::Leave => Call::post("/v1/leave"),
            Self::Remove { hostname } => Call::post_json("/v1/remove", &RemoveRequest { hostname })?,
            Self::Promote { hostname } => {
                Call::post_json("/v1/promote", &PromoteRequest { hostname })?
            }
            Self::Status => Call::get("/v1/status"),
            Self::Token => Call::post("/v1/token"),
            Self::Tls => Call::post("/v1/tls"),
            Self::Config { key, value } => {
                Call::post_json("/v1/config", &ConfigUpdateRequest { key, value })?
            }
            Self::Network { action } => Call::post_json("/v1/network", &NetworkRequest { action })?,
            Self::Reload => Call::post("/v1/reload"),
            Self::Group(command) => command.into_call()?,
        };
        Ok(call)
    }
}

impl GroupCommand {
    fn into_call(self) -> anyhow::Result<Call> {
        let call = match self {
            Self::New { name } => Call::post_json("/v1/group/new", &group(name))?,
            Self::Delete { name } => Call::post_json("/v1/group/delete", &group(Some(name)))?,
            Self::Add { name, ips } => Call::post_json(
                "/v1/group/add",
                &GroupRequest {
                    ips,
                    ..group(Some(name))
                },
            )?,
            Self::Remove { name, ips } => Call::post_json(
                "/v1/group/remove",
                &GroupRequest {
                    ips,
                    ..group(Some(name))
                },
            )?,
            Self::Assign { name, iface, node } => Call::post_json(
                "/v1/group/assign",
                &GroupRequest {
                    iface: Some(iface),
                    node,
                    ..group(Some(name))
                },
            )?,
            Self::Unassign { name, iface, node } => Call::post_json(
                "/v1/group/unassign",
                &GroupRequest {
                    iface: Some(iface),
                    node,
                    ..group(Some(name))
                },
            )?,
            Self::List => Call::get("/v1/group/list"),
        };
        Ok(call)
    }
}

async fn send(addr: &str, call: Call) -> anyhow::Result<ControlReply> {
    let url = format!("http://{addr}{}", call.path);
    let client = reqwest::Client::new();
    let request = match call.method {
        Method::Get => client.get(&url),
        Method::Post => client.post(&url),
    };
    let request = match &call.body {
        Some(body) => request.json(body),
        None => request,
    };
    let response = request
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("PulseHA daemon unreachable at {addr}: {e}"))?;
    let status = response.status();
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|_| {
        anyhow::anyhow!(
            "unexpected {status} from daemon: {}",
            String::from_utf8_lossy(&bytes)
        )
    })
}

fn print_status(rows: &[StatusRow]) {
    println!(
        "{:<20} {:<22} {:<12} {:<10} {:<31} {:>5}",
        "Hostname", "Address", "Status", "Latency", "Last received", "Score"
    );
    for row in rows {
        let hostname = if row.local {
            format!("{} (local)", row.hostname)
        } else {
            row.hostname.clone()
        };
        println!(
            "{:<20} {:<22} {:<12} {:<10} {:<31} {:>5}",
            hostname,
            format!("{}:{}", row.address, row.port),
            row.status.as_str(),
            row.latency,
            row.last_received,
            row.score
        );
    }
}

fn print_groups(listing: &GroupListing) {
    if listing.groups.is_empty() {
        println!("No floating IP groups");
    }
    for (name, ips) in &listing.groups {
        println!("{name}: {}", ips.join(", "));
    }
    for row in &listing.assignments {
        println!("{} {}: {}", row.hostname, row.iface, row.groups.join(", "));
    }
}

fn render(reply: &ControlReply) {
    if !reply.message.is_empty() {
        println!("{}", reply.message);
    }
    match &reply.data {
        Some(ControlData::Token { token }) => println!("Token: {token}"),
        Some(ControlData::Status { members }) => print_status(members),
        Some(ControlData::Groups(listing)) => print_groups(listing),
        None => {}
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let Cli { addr, command } = Cli::parse();
    let result = async move {
        let call = command.into_call()?;
        send(&addr, call).await
    }
    .await;

    match result {
        Ok(reply) if reply.success => {
            render(&reply);
            ExitCode::SUCCESS
        }
        Ok(reply) => {
            eprintln!("Error: {}", reply.message);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
