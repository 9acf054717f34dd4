//! wcsa: SSH agent for Windows certificate store keys
//!
//! Single binary that:
//! - Serves smart card and certificate store keys to Cygwin, WSL, Windows
//!   OpenSSH, SecureCRT, PuTTY, Xshell and Hyper-V clients
//! - Relays to the host's agent when run inside a Hyper-V guest
//! - Lists keys and transports for inspection

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wcsa_cli::commands;
use wcsa_cli::output::print_error;
use wcsa_cli::settings::{effective_config, ConfigOverrides};

#[derive(Parser)]
#[command(name = "wcsa")]
#[command(author, version, about = "SSH agent backed by the Windows certificate store")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the agent on every enabled transport (default)
    Run,

    /// Print the available public keys in authorized_keys format
    Keys,

    /// List transports and whether they are supported and enabled
    Transports,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show the default config file path
    Path,
    /// Write a config file with the default settings
    Init {
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // These work without a valid configuration
    let command = cli.command.unwrap_or(Commands::Run);
    match command {
        Commands::Config {
            action: ConfigAction::Path,
        } => {
            commands::config_path();
            return Ok(());
        }
        Commands::Config {
            action: ConfigAction::Init { force },
        } => {
            if let Err(e) = commands::config_init(cli.config.as_deref(), force) {
                print_error(&format!("{:#}", e));
                return Err(e);
            }
            return Ok(());
        }
        _ => {}
    }

    let config = match effective_config(cli.config.as_deref(), &cli.overrides) {
        Ok(config) => config,
        Err(e) => {
            print_error(&format!("{:#}", e));
            return Err(e);
        }
    };

    match command {
        Commands::Run => {
            tracing::info!("WinCrypt SSH agent starting...");
            let cancel = CancellationToken::new();
            let cancel_on_signal = cancel.clone();
            tokio::spawn(async move {
                commands::shutdown_signal().await;
                cancel_on_signal.cancel();
            });
            commands::run_agent(config, cancel).await?;
        }

        Commands::Keys => {
            commands::keys_command(&config).await?;
        }

        Commands::Transports => {
            commands::transports_command(&config);
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&config)?,
            ConfigAction::Path | ConfigAction::Init { .. } => {}
        },
    }

    Ok(())
}
