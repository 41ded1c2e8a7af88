//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for hieravg nodes.

use clap::{Args, Parser, Subcommand};

use crate::config::NodeConfig;
use crate::types::ParamVector;

/// hieravg - hierarchical weighted parameter averaging
///
/// Runs one participant of an averaging tree: the root that publishes each
/// new global value, a relay that aggregates a subtree, or a leaf client.
#[derive(Parser, Debug)]
#[command(name = "hieravg")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Listening socket options shared by root and relay
#[derive(Args, Debug, Clone, Default)]
pub struct ListenArgs {
    /// Path to configuration file
    #[arg(short, long, env = "HIERAVG_CONFIG")]
    pub config: Option<String>,

    /// Interface to bind (default 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (default 30000)
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the root node (publishes every new global value)
    Root {
        #[command(flatten)]
        listen: ListenArgs,
    },

    /// Run a relay node (aggregates children, forwards to a parent)
    Relay {
        #[command(flatten)]
        listen: ListenArgs,

        /// Parent node host (default 127.0.0.1)
        #[arg(long)]
        parent_host: Option<String>,

        /// Parent node port (default 30000)
        #[arg(long)]
        parent_port: Option<u16>,
    },

    /// Run a leaf client that submits a fixed update every round
    Leaf {
        /// Path to configuration file
        #[arg(short, long, env = "HIERAVG_CONFIG")]
        config: Option<String>,

        /// Node host to connect to (default 127.0.0.1)
        #[arg(long)]
        server_host: Option<String>,

        /// Node port to connect to (default 30000)
        #[arg(long)]
        server_port: Option<u16>,

        /// Comma-separated vector to submit, e.g. 1.0,2.5
        #[arg(long, allow_hyphen_values = true)]
        value: Option<ParamVector>,

        /// Weight attached to each update
        #[arg(long)]
        weight: Option<f64>,

        /// Delay before each submission in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Number of rounds to take part in (0 = until stopped)
        #[arg(long)]
        rounds: Option<u64>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

impl ListenArgs {
    /// CLI flags take precedence over file and environment
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(ref host) = self.host {
            config.node.host = host.clone();
        }
        if let Some(port) = self.port {
            config.node.port = port;
        }
    }
}
