mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let policy_env = std::env::var("MECHANIC_RUNTIME_ENV").unwrap_or_else(|_| "prod".to_string());
    init_tracing(&policy_env);

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, http_addr } => commands::run::run(config, http_addr).await?,
        Commands::Check { config } => commands::check::run(config).await?,
        Commands::Version => commands::version::run()?,
    }

    Ok(())
}

fn init_tracing(runtime_env: &str) {
    use tracing_subscriber::EnvFilter;

    let default_level = if runtime_env == "prod" { "info" } else { "debug" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if runtime_env == "prod" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
