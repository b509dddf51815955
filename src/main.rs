//! Vault Rescue - unattended withdrawal from a capacity-limited ERC-4626 vault
//!
//! # WARNING
//! - The ephemeral secret you supply signs real transactions.
//! - Use a fresh wallet holding only the vault shares and some gas.
//! - A non-listed endpoint can lie about vault state and front-run you.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

// Use the library crate
use vault_rescue::cli::commands;
use vault_rescue::config::Config;
use vault_rescue::redact::scrub;

/// Vault Rescue - redeem and forward the moment capacity appears
#[derive(Parser)]
#[command(name = "rescue")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "rescue.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Arm a session and monitor until the rescue lands
    Run {
        /// Read the secret from RESCUE_SECRET_KEY only, never prompt
        #[arg(long)]
        secret_from_env: bool,
    },

    /// Check endpoint trust, chain id, block and gas cost
    Health,

    /// Probe the configured vault's asset()
    Probe,

    /// Derive the ephemeral address and show its gas balance
    Derive {
        /// Read the secret from RESCUE_SECRET_KEY only, never prompt
        #[arg(long)]
        secret_from_env: bool,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vault_rescue=info".parse()?),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    startup_checks();

    let result = match cli.command {
        Commands::Run { secret_from_env } => commands::run(&config, secret_from_env).await,
        Commands::Health => commands::health(&config).await,
        Commands::Probe => commands::probe(&config).await,
        Commands::Derive { secret_from_env } => commands::derive(&config, secret_from_env).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", scrub(&format!("{:#}", e)));
        std::process::exit(1);
    }

    Ok(())
}

/// Warn when a secret sits in a readable .env file
fn startup_checks() {
    if std::env::var(commands::SECRET_ENV).is_err() {
        return;
    }
    warn!("{} is set; it will be used instead of prompting", commands::SECRET_ENV);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Ok(metadata) = std::fs::metadata(".env") {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    ".env has permissions {:o}; run 'chmod 600 .env' so other users cannot read the secret",
                    mode & 0o777
                );
            } else {
                info!(".env permissions OK");
            }
        }
    }
}
