//! hieravg - hierarchical weighted parameter averaging
//!
//! Entry point for the `hieravg` binary. Runs a root, relay or leaf
//! participant until Ctrl-C, or manages the configuration file.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use hieravg::cli::{Cli, Commands, ConfigSubcommand};
use hieravg::config::{self, NodeConfig};
use hieravg::error::Error;
use hieravg::leaf::{FixedUpdate, LeafClient};
use hieravg::logging;
use hieravg::node::{self, NodeRole};
use hieravg::version;

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity).
    // Malformed arguments exit here with clap's usage message and code 2.
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        report_and_exit(&e);
    }
}

fn report_and_exit(err: &anyhow::Error) -> ! {
    match err.downcast_ref::<Error>() {
        Some(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
        None => {
            eprintln!("\x1b[31mError\x1b[0m: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    // Commands that don't need the runtime or full logging
    let (config_path, role) = match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Root { listen } => (listen.config.clone(), Some(NodeRole::Root)),
        Commands::Relay { listen, .. } => (listen.config.clone(), Some(NodeRole::Relay)),
        Commands::Leaf { config, .. } => (config.clone(), None),
    };

    let mut config = NodeConfig::load(config_path.as_deref())?;
    apply_cli_overrides(&cli.command, &mut config);
    config.validate()?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting hieravg"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("hieravg")
        .build()
        .context("Failed to create async runtime")?;

    match role {
        Some(role) => runtime.block_on(run_node(role, config)),
        None => runtime.block_on(run_leaf(config)),
    }
}

/// CLI flags override file and environment settings
fn apply_cli_overrides(command: &Commands, config: &mut NodeConfig) {
    match command {
        Commands::Root { listen } => listen.apply(config),
        Commands::Relay {
            listen,
            parent_host,
            parent_port,
        } => {
            listen.apply(config);
            if let Some(host) = parent_host {
                config.relay.parent_host = host.clone();
            }
            if let Some(port) = parent_port {
                config.relay.parent_port = *port;
            }
        }
        Commands::Leaf {
            server_host,
            server_port,
            value,
            weight,
            interval_ms,
            rounds,
            ..
        } => {
            if let Some(host) = server_host {
                config.leaf.server_host = host.clone();
            }
            if let Some(port) = server_port {
                config.leaf.server_port = *port;
            }
            if let Some(value) = value {
                config.leaf.value = value.as_slice().to_vec();
            }
            if let Some(weight) = weight {
                config.leaf.weight = *weight;
            }
            if let Some(interval) = interval_ms {
                config.leaf.update_interval_ms = *interval;
            }
            if let Some(rounds) = rounds {
                config.leaf.rounds = *rounds;
            }
        }
        Commands::Version | Commands::Config { .. } => {}
    }
}

/// Run a root or relay node until Ctrl-C
async fn run_node(role: NodeRole, config: NodeConfig) -> anyhow::Result<()> {
    let handle = match role {
        NodeRole::Root => node::start_root(&config).await?,
        NodeRole::Relay => {
            // The parent may be down at start-up; keep Ctrl-C responsive
            tokio::select! {
                started = node::start_relay(&config) => started?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received before the parent was reached");
                    return Ok(());
                }
            }
        }
    };

    info!(role = %handle.role(), addr = %handle.local_addr(), "Node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    handle.shutdown().await;
    Ok(())
}

/// Run a leaf client that submits the configured update every round
async fn run_leaf(config: NodeConfig) -> anyhow::Result<()> {
    let addr = config.leaf.server_addr();
    let mut client = LeafClient::connect(
        &addr,
        config.node.max_frame_bytes,
        config.node.handshake_timeout(),
    )
    .await?;
    info!(
        server = %client.peer(),
        token = %client.latest().token.short(),
        value = %client.latest().value,
        "Connected"
    );

    let mut source = FixedUpdate::new(
        config.leaf.update_vector(),
        config.leaf.weight,
        Duration::from_millis(config.leaf.update_interval_ms),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = client.run(&mut source, config.leaf.rounds, shutdown_rx).await;
    signal.abort();
    let completed = result?;

    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close connection cleanly");
    }
    info!(rounds = completed, "Leaf finished");
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg).map_err(Error::from)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}

