//! Conductor daemon entry point.
//!
//! Binary name: `conductord`
//!
//! Loads configuration, initializes the backend and runner, resumes
//! interrupted runs, then serves the REST API until a shutdown signal.

mod http;
mod server;
mod state;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conductor_core::backend::ApiKeyStore;
use conductor_core::auth::mint_api_key;
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

use state::AppState;

#[derive(Parser)]
#[command(name = "conductord", version, about = "Conductor workflow-execution service")]
struct Cli {
    /// Path to conductor.toml (defaults to <data-dir>/conductor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Serve {
        /// TCP bind address (overrides config and CONDUCTOR_TCP_ADDR).
        #[arg(long)]
        tcp: Option<String>,

        /// Local socket path (overrides config and CONDUCTOR_LISTEN_SOCKET).
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Bridge tracing spans to OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Mint an API key. The plaintext is printed once and never stored.
    CreateKey {
        #[arg(long, default_value = "default")]
        name: String,

        /// Comma-separated scope patterns (empty grants admin access).
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let otel = matches!(&cli.command, Commands::Serve { otel: true, .. });
    if otel {
        conductor_observe::tracing_setup::init_tracing(true)
            .map_err(|e| anyhow::anyhow!("tracing init: {e}"))?;
    } else {
        let filter = match cli.verbose {
            0 if cli.quiet => "error",
            0 => "info",
            1 => "info,conductor_core=debug,conductor_api=debug",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
            )
            .with_target(false)
            .init();
    }

    let data_dir = conductor_infra::config::resolve_data_dir();
    let mut config = conductor_infra::config::load_config(&data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { tcp, socket, .. } => {
            if let Some(tcp) = tcp {
                config.listener.tcp_addr = Some(tcp);
            }
            if let Some(socket) = socket {
                config.listener.socket = Some(socket);
            }
            if std::env::var("CONDUCTOR_AUTO_STARTED").as_deref() == Ok("1") {
                tracing::info!("auto-started by client");
            }

            let state = AppState::init(config, data_dir).await?;

            // First run with auth enabled: mint the initial admin key and
            // show it once.
            if state.config.auth.require_auth
                && state.config.auth.bearer_token.is_none()
                && state.backend.list_api_keys().await?.is_empty()
            {
                let key = mint_api_key(state.backend.as_ref(), "default", vec![], None).await?;
                println!();
                println!(
                    "  {} API key generated (save this -- it won't be shown again):",
                    console::style("🔑").bold()
                );
                println!();
                println!("  {}", console::style(key.expose_secret()).yellow().bold());
                println!();
            }

            let resumed = state.runner.resume_interrupted().await?;
            if resumed > 0 {
                tracing::info!(resumed, "interrupted runs re-admitted");
            }

            server::run(state).await?;
        }

        Commands::CreateKey { name, scopes } => {
            let state = AppState::init(config, data_dir).await?;
            let key = mint_api_key(state.backend.as_ref(), &name, scopes, None).await?;
            println!("{}", key.expose_secret());
        }
    }

    Ok(())
}
