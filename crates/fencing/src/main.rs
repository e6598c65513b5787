//! CLI for the fencing client engine.
//!
//! Run `fence-client --help` for usage information.

// CLI binaries legitimately need println! for user output
#![allow(clippy::disallowed_macros)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fencing::client::{events, FenceEvent, HistoryEntry};
use fencing::{
    ActionOutcome, CallOptions, ConnectionMode, FenceAction, FencerClient, FencingConfig, NodeRef,
    Victim,
};

#[derive(Parser)]
#[command(name = "fence-client")]
#[command(about = "Run fence agents and talk to the fencer")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "FENCING_CONFIG")]
    config: Option<PathBuf>,

    /// Fencer socket, overriding the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Output format: json, text
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fence agent locally
    Exec {
        /// Agent executable (path or name on PATH)
        #[arg(short, long)]
        agent: String,

        /// Action to request from the agent
        #[arg(long, default_value = "monitor")]
        action: String,

        /// Node to act on
        #[arg(short, long)]
        target: Option<String>,

        /// Cluster node id of the target
        #[arg(long, default_value_t = 0)]
        nodeid: u32,

        /// Overall timeout in seconds, retries included
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// Device parameter passed to the agent (repeatable)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,

        /// Port to use for a node (repeatable)
        #[arg(long = "port-map", value_name = "NODE=PORT")]
        port_map: Vec<String>,

        /// Report the pid once started, then wait for the result
        #[arg(long = "async")]
        run_async: bool,
    },

    /// Ask the fencer to fence a node
    Fence {
        /// Node to fence
        target: String,

        /// Action: reboot, off, on
        #[arg(long, default_value = "reboot")]
        action: String,

        /// Timeout in seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,

        /// Accept a matching fencing completed within this many seconds
        #[arg(long, default_value_t = 0)]
        tolerance: u64,

        /// Treat the target as a cluster node id
        #[arg(long)]
        nodeid: bool,
    },

    /// Confirm a node is down without fencing it
    Confirm {
        /// Node known to be safely down
        target: String,
    },

    /// Show fencing history
    History {
        /// Only this node
        #[arg(short, long)]
        node: Option<String>,

        /// Timeout in seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    /// List the ports a device controls
    List {
        device: String,

        /// Timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Check that a device is reachable
    Monitor {
        device: String,

        /// Timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Check the power status of a port
    Status {
        device: String,
        port: String,

        /// Timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// List devices able to fence a node
    Query {
        target: String,

        /// Timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Fence a node and wait for the result
    Kick {
        /// Node name
        #[arg(long, conflicts_with = "nodeid", required_unless_present = "nodeid")]
        name: Option<String>,

        /// Cluster node id
        #[arg(long)]
        nodeid: Option<u32>,

        /// Power off instead of reboot
        #[arg(long)]
        off: bool,

        /// Timeout in seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    /// Show when a node was last fenced
    LastFenced {
        /// Node name
        #[arg(long, conflicts_with = "nodeid", required_unless_present = "nodeid")]
        name: Option<String>,

        /// Cluster node id
        #[arg(long)]
        nodeid: Option<u32>,

        /// Report now if an operation is still pending
        #[arg(long)]
        in_progress: bool,
    },

    /// Print fencing events until the fencer disconnects
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = FencingConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    let format = cli.format;

    match cli.command {
        Commands::Exec {
            agent,
            action,
            target,
            nodeid,
            timeout,
            options,
            port_map,
            run_async,
        } => {
            let device_args: BTreeMap<String, String> = parse_pairs(&options)?.into_iter().collect();
            let port_map: HashMap<String, String> = parse_pairs(&port_map)?.into_iter().collect();
            let mut fence_action = FenceAction::new(agent, action, Duration::from_secs(timeout))
                .with_device_args(device_args)
                .with_port_map(port_map)
                .with_settings(config.agent_settings());
            if let Some(target) = target {
                fence_action = fence_action.with_victim(Victim::new(target, nodeid));
            }
            run_exec(fence_action, run_async, format).await?;
        }
        Commands::Fence {
            target,
            action,
            timeout,
            tolerance,
            nodeid,
        } => {
            let client = connect(&config).await?;
            let options = CallOptions::sync().with_cs_nodeid(nodeid);
            let result = client
                .fence(
                    options,
                    &target,
                    &action,
                    Duration::from_secs(timeout),
                    Duration::from_secs(tolerance),
                )
                .await;
            client.disconnect();
            result.with_context(|| format!("Fencing {target} failed"))?;
            print_done(format, &format!("{target} fenced ({action})"));
        }
        Commands::Confirm { target } => {
            let client = connect(&config).await?;
            let result = client.confirm(CallOptions::sync(), &target).await;
            client.disconnect();
            result.with_context(|| format!("Confirming {target} failed"))?;
            print_done(format, &format!("{target} confirmed down"));
        }
        Commands::History { node, timeout } => {
            let client = connect(&config).await?;
            let result = client
                .history(CallOptions::sync(), node.as_deref(), Duration::from_secs(timeout))
                .await;
            client.disconnect();
            print_history(format, &result.context("Failed to retrieve fencing history")?)?;
        }
        Commands::List { device, timeout } => {
            let client = connect(&config).await?;
            let result = client
                .list(CallOptions::sync(), &device, Duration::from_secs(timeout))
                .await;
            client.disconnect();
            let ports = result.with_context(|| format!("Listing {device} failed"))?;
            match format {
                OutputFormat::Json => println!("{}", json!({ "device": device, "ports": ports })),
                OutputFormat::Text => print!("{}", ports.unwrap_or_default()),
            }
        }
        Commands::Monitor { device, timeout } => {
            let client = connect(&config).await?;
            let result = client
                .monitor(CallOptions::sync(), &device, Duration::from_secs(timeout))
                .await;
            client.disconnect();
            result.with_context(|| format!("Monitoring {device} failed"))?;
            print_done(format, &format!("{device} is reachable"));
        }
        Commands::Status {
            device,
            port,
            timeout,
        } => {
            let client = connect(&config).await?;
            let result = client
                .status(CallOptions::sync(), &device, &port, Duration::from_secs(timeout))
                .await;
            client.disconnect();
            result.with_context(|| format!("Status of {device} port {port} failed"))?;
            print_done(format, &format!("{device} port {port} is on"));
        }
        Commands::Query { target, timeout } => {
            let client = connect(&config).await?;
            let result = client
                .query(CallOptions::sync(), &target, Duration::from_secs(timeout))
                .await;
            client.disconnect();
            let devices = result.with_context(|| format!("Query for {target} failed"))?;
            match format {
                OutputFormat::Json => println!("{}", json!({ "target": target, "devices": devices })),
                OutputFormat::Text => {
                    for device in devices {
                        println!("{device}");
                    }
                }
            }
        }
        Commands::Kick {
            name,
            nodeid,
            off,
            timeout,
        } => {
            let node = node_ref(name, nodeid)?;
            fencing::client::kick(&config, &node, Duration::from_secs(timeout), off)
                .await
                .with_context(|| format!("Could not kick {node}"))?;
            print_done(format, &format!("{node} kicked"));
        }
        Commands::LastFenced {
            name,
            nodeid,
            in_progress,
        } => {
            let node = node_ref(name, nodeid)?;
            let when = fencing::client::last_fenced_time(&config, &node, in_progress)
                .await
                .with_context(|| format!("Could not look up {node}"))?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    json!({ "node": node.to_string(), "last_fenced": when.map(|w| w.to_rfc3339()) })
                ),
                OutputFormat::Text => match when {
                    Some(when) => println!("{node} last fenced at {when}"),
                    None => println!("{node} has not been fenced"),
                },
            }
        }
        Commands::Watch => run_watch(&config, format).await?,
    }

    Ok(())
}

async fn connect(config: &FencingConfig) -> Result<FencerClient> {
    let client = FencerClient::new(config.clone());
    client
        .connect(ConnectionMode::Command)
        .await
        .with_context(|| format!("Could not connect to the fencer at {}", config.socket_path.display()))?;
    Ok(client)
}

async fn run_exec(action: FenceAction, run_async: bool, format: OutputFormat) -> Result<()> {
    let outcome = if run_async {
        let (tx, rx) = oneshot::channel();
        let pid = action
            .execute_async(move |outcome| {
                let _ = tx.send(outcome);
            })
            .await
            .context("Failed to start fence agent")?;
        info!(pid, "Fence agent started");
        if format == OutputFormat::Text {
            println!("started pid {pid}");
        }
        rx.await.context("Fence agent tracking stopped unexpectedly")?
    } else {
        let mut action = action;
        action.execute().await
    };
    print_outcome(format, &outcome);
    if let Err(e) = outcome.result {
        bail!("Fence agent failed: {e}");
    }
    Ok(())
}

async fn run_watch(config: &FencingConfig, format: OutputFormat) -> Result<()> {
    let client = FencerClient::new(config.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<FenceEvent>();
    for event in [events::FENCE, events::DISCONNECT] {
        let tx = tx.clone();
        client
            .subscribe(event, "fence-client-watch", move |event: &FenceEvent| {
                let _ = tx.send(event.clone());
            })
            .await?;
    }
    drop(tx);
    client
        .connect(ConnectionMode::EventLoop)
        .await
        .with_context(|| format!("Could not connect to the fencer at {}", config.socket_path.display()))?;

    while let Some(event) = rx.recv().await {
        if event.event == events::DISCONNECT {
            info!("Fencer disconnected");
            break;
        }
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
            OutputFormat::Text => println!(
                "{} {} of {} by {} for {}: rc={}",
                event.operation.as_deref().unwrap_or("fence"),
                event.action.as_deref().unwrap_or("-"),
                event.target.as_deref().unwrap_or("-"),
                event.executioner.as_deref().unwrap_or("-"),
                event.client_origin.as_deref().unwrap_or("-"),
                event.result_code,
            ),
        }
    }
    Ok(())
}

fn parse_pairs(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("Expected KEY=VALUE, got {pair:?}"),
        })
        .collect()
}

fn node_ref(name: Option<String>, nodeid: Option<u32>) -> Result<NodeRef> {
    match (name, nodeid) {
        (Some(name), _) => Ok(NodeRef::Name(name)),
        (None, Some(id)) if id > 0 => Ok(NodeRef::Id(id)),
        _ => bail!("A node name or a non-zero node id is required"),
    }
}

fn print_done(format: OutputFormat, message: &str) {
    match format {
        OutputFormat::Json => println!("{}", json!({ "ok": true, "message": message })),
        OutputFormat::Text => println!("{message}"),
    }
}

fn print_outcome(format: OutputFormat, outcome: &ActionOutcome) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "pid": outcome.pid,
                "rc": outcome.rc(),
                "error": outcome.result.as_ref().err().map(ToString::to_string),
                "attempts": outcome.attempts,
                "output": outcome.output,
                "error_output": outcome.error_output,
            })
        ),
        OutputFormat::Text => {
            print!("{}", outcome.output);
            println!("rc={} attempts={}", outcome.rc(), outcome.attempts);
        }
    }
}

fn print_history(format: OutputFormat, entries: &[HistoryEntry]) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No fencing history");
            }
            for entry in entries {
                let completed = entry
                    .completed
                    .map_or_else(|| "-".to_string(), |c| c.to_rfc3339());
                println!(
                    "{:<8} {:<7} {:<20} by {:<20} for {:<20} {}",
                    format!("{:?}", entry.state).to_lowercase(),
                    entry.action,
                    entry.target,
                    entry.delegate.as_deref().unwrap_or("-"),
                    entry.client.as_deref().unwrap_or("-"),
                    completed,
                );
            }
        }
    }
    Ok(())
}
