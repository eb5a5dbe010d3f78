//! `brrelayd`: the Bison Relay routing core daemon (§4.Q). Parses CLI flags,
//! prompts for and opens the identity vault, constructs the client config,
//! spawns the orchestrator (O) and the control-plane IPC server, and runs
//! until a shutdown signal is received via a `watch::channel`/task-abort
//! shutdown sequence.

mod dispatch;
mod ipc_handler;
mod orchestrator;
mod session;

use anyhow::{anyhow, Result};
use brcore::config::{load_config, save_config};
use brcore::ipc::IpcServer;
use brcore::paths::{control_socket_path, data_dir, log_dir};
use brcore::secure_storage::store_ipc_secret;
use brcore::vault::Vault;
use clap::{Parser, Subcommand};
use ipc_handler::CoreIpcHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Bison Relay routing core daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new encrypted identity vault.
    Init {
        #[arg(long)]
        app_dir: Option<PathBuf>,
    },
    /// Run the routing core against an existing vault.
    Run {
        #[arg(long)]
        app_dir: Option<PathBuf>,
        /// Relay server address to dial, overriding the vaulted config.
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { app_dir } => init_command(app_dir).await,
        Commands::Run { app_dir, server } => run_command(app_dir, server).await,
    }
}

fn vault_path(app_dir: &std::path::Path) -> PathBuf {
    app_dir.join("id").join("identity")
}

async fn init_command(app_dir_override: Option<PathBuf>) -> Result<()> {
    let app_dir = app_dir_override.unwrap_or(data_dir()?);
    std::fs::create_dir_all(&app_dir)?;
    std::fs::create_dir_all(log_dir()?)?;
    let path = vault_path(&app_dir);
    if path.exists() {
        return Err(anyhow!("vault already exists at {}", path.display()));
    }
    let password = prompt_password_twice("Create vault password")?;
    let vault = Vault::create_new(&path, &password)?;
    println!("Identity vault created.");
    println!("User ID: {}", vault.payload.user_id_hex);
    Ok(())
}

async fn run_command(app_dir_override: Option<PathBuf>, server_override: Option<String>) -> Result<()> {
    let app_dir = app_dir_override.unwrap_or(data_dir()?);
    std::fs::create_dir_all(&app_dir)?;
    std::fs::create_dir_all(log_dir()?)?;

    let path = vault_path(&app_dir);
    if !path.exists() {
        return Err(anyhow!("identity vault missing; run `init` first"));
    }
    let password = prompt_password_once("Enter vault password")?;
    let mut vault = Vault::open(&path, &password)?;

    let mut config = load_config(&vault)?;
    if let Some(server) = server_override {
        config.server = server;
        save_config(&mut vault, &config)?;
    }

    let ipc_secret = vault.ipc_shared_secret()?;
    store_ipc_secret(&vault.payload.user_id_hex, &ipc_secret)?;
    let socket_path = control_socket_path()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (core, running) = orchestrator::start(vault, config, app_dir, shutdown_rx).await?;
    for peer in core.registry.all_ids() {
        dispatch::install_peer_handler(core.clone(), peer);
    }

    let handler = Arc::new(CoreIpcHandler { core: core.clone() });
    let server = Arc::new(IpcServer::new(ipc_secret, socket_path));
    let server_task = {
        let server = server.clone();
        let handler = handler.clone();
        tokio::spawn(async move { server.start(handler).await })
    };

    info!("brrelayd started");
    signal::ctrl_c().await?;
    info!("brrelayd stopping");

    let _ = shutdown_tx.send(true);
    server_task.abort();
    for handle in running.handles {
        handle.abort();
    }

    Ok(())
}

fn prompt_password_once(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("BISONRELAY_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))
}

fn prompt_password_twice(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("BISONRELAY_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let first = prompt_password_once(prompt)?;
    let second =
        rpassword::prompt_password("Confirm password").map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
