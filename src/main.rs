//! BuddyMirror - Buddy Group Mirroring Node
//!
//! Runs one node of a buddy mirrored service and offers a few
//! inspection commands.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use buddymirror::config::BuddyMirrorConfig;
use buddymirror::error::{Error, Result};
use buddymirror::mirror::Message;
use buddymirror::network::send_once;
use buddymirror::node::MirrorNode;
use buddymirror::resync::marker::read_marker_file;

/// BuddyMirror - Buddy Group Mirroring Node
#[derive(Parser)]
#[command(name = "buddymirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "buddymirror.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Query the status of a running node
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:7700")]
        address: String,
    },

    /// Show the persisted resync decision
    Marker,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "buddymirror.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value_t = 1)]
        node_id: u32,

        /// Target served by the node
        #[arg(long, default_value_t = 1)]
        target_id: u16,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config file may not exist yet for init and status
    let logging = BuddyMirrorConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Marker => run_marker(cli.config),
        Commands::Init {
            output,
            node_id,
            target_id,
        } => run_init(output, node_id, target_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    let json = format == "json";

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting BuddyMirror node...");

    let config = match BuddyMirrorConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!(
        "Loaded configuration for node {} (target {})",
        config.node.id,
        config.node.target_id
    );

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let node = match MirrorNode::new(config).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("Failed to initialize node: {}", e);
            return Err(e);
        }
    };

    let running = tokio::spawn(std::sync::Arc::clone(&node).run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    node.shutdown();
    match running.await {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(format!("node task failed: {}", e))),
    }
}

/// Query node status
async fn run_status(address: String) -> Result<()> {
    match send_once(&address, Message::StatusRequest, Duration::from_secs(5)).await {
        Ok(Message::StatusResponse(status)) => {
            let json = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", json);
            Ok(())
        }
        Ok(other) => {
            eprintln!("Unexpected answer: {}", other.type_name());
            Err(Error::UnexpectedResponse("StatusResponse"))
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(e)
        }
    }
}

/// Print the resync marker of the configured data directory
fn run_marker(config_path: PathBuf) -> Result<()> {
    let config = BuddyMirrorConfig::from_file(&config_path)?;
    let state = read_marker_file(config.data_dir());

    println!("Resync marker:    {}", state);
    println!("  Required:       {}", state.is_required());
    println!("  Acknowledged:   {}", !state.is_unacked());
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: u32, target_id: u16) -> Result<()> {
    let config_content = format!(
        r#"# BuddyMirror Configuration
# Generated configuration file

[node]
id = {node_id}
node_type = "meta"
target_id = {target_id}
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/buddymirror/{node_id}"

[coordinator]
address = "mgmt.example.com:7700"
request_timeout_ms = 5000
retry_delay_ms = 5000
poll_interval_ms = 10000

[mirroring]
window_capacity = 12
forward_timeout_ms = 10000
connect_timeout_ms = 3000

[states]
poffline_timeout_ms = 30000
offline_timeout_ms = 180000

[resync]
# command = "/usr/sbin/buddy-resync --target {target_id}"

[logging]
level = "info"
format = "pretty"

# [[peers]]
# id = 2
# address = "node-2.example.com:7700"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the coordinator and peer addresses.");
    println!("Then start with: buddymirror start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match BuddyMirrorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Target ID: {}", config.node.target_id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Coordinator: {}", config.coordinator.address);
            println!("  Peers: {}", config.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = BuddyMirrorConfig::from_file(&config_path)?;

    println!("BuddyMirror Node Information");
    println!("============================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Node Type:        {}", config.node.node_type);
    println!("Target ID:        {}", config.node.target_id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Coordinator:");
    println!("  Address:        {}", config.coordinator.address);
    println!("  Retry Delay:    {} ms", config.coordinator.retry_delay_ms);
    println!("  Poll Interval:  {} ms", config.coordinator.poll_interval_ms);
    println!();
    println!("Mirroring:");
    println!("  Window:         {}", config.mirroring.window_capacity);
    println!("  Forward Limit:  {} ms", config.mirroring.forward_timeout_ms);
    println!();
    println!("Target States:");
    println!("  Probably Off:   {} ms", config.states.poffline_timeout_ms);
    println!("  Offline:        {} ms", config.states.offline_timeout_ms);
    println!();
    println!("Peers:");
    for peer in &config.peers {
        println!("  {:<5}          {}", peer.id, peer.address);
    }

    Ok(())
}
