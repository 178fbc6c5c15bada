use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "node-mechanic")]
#[command(about = "Per-node maintenance agent: cordons and drains ahead of scheduled platform events")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the agent (watch or polling driver, per config)
    Run {
        /// Path to a TOML policy file; MECHANIC_* env vars override it
        #[arg(long, env = "MECHANIC_CONFIG")]
        config: Option<PathBuf>,

        /// Address the /healthz, /readyz, and /metrics endpoints bind to
        #[arg(long, env = "MECHANIC_HTTP_ADDR", default_value = "0.0.0.0:8080")]
        http_addr: SocketAddr,
    },

    /// One-shot cluster connectivity and RBAC probe
    Check {
        #[arg(long, env = "MECHANIC_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Display application version
    Version,
}
