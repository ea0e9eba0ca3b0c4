//! CLI entry point for tabmux.

mod cli;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tabmux::build_info::startup_metadata_line;
use tabmux::client::GatewayClient;
use tabmux::config::{initialize_default_global_config, load_config, Config, GlobalConfigInitResult};
use tabmux::gateway::spawn_gateway;
use tabmux::protocol::{ClientMessage, ClientPayload, CloseRequest, ServerPayload};
use tabmux::tmux::{Multiplexer, TmuxControl};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const KILL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = cli::Args::parse();

    if let cli::Command::Init { force } = args.command {
        return match initialize_default_global_config(force) {
            Ok(GlobalConfigInitResult::Created { path }) => {
                println!("created {}", path.display());
                ExitCode::SUCCESS
            }
            Ok(GlobalConfigInitResult::AlreadyInitialized { path }) => {
                println!("{} already exists (use --force to replace it)", path.display());
                ExitCode::SUCCESS
            }
            Ok(GlobalConfigInitResult::Overwritten { path, backup_path }) => {
                println!("rewrote {} (backup: {})", path.display(), backup_path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match load_config(args.config.as_deref()) {
        Ok(loaded) => {
            if let Some(source) = &loaded.source {
                info!(path = %source.display(), "loaded config");
            }
            loaded.config
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        cli::Command::Serve { listen } => serve(&config, listen).await,
        cli::Command::List => list(&config).await,
        cli::Command::Kill { name } => kill(&config, &name).await,
        cli::Command::Init { .. } => Ok(()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

/// `TABMUX_LOG`, then `RUST_LOG`, then `info`.
fn init_tracing() {
    let filter = std::env::var("TABMUX_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(config: &Config, listen: Option<String>) -> Result<(), String> {
    let listen = listen.unwrap_or_else(|| config.gateway.listen.clone());
    let mux = Arc::new(TmuxControl::new(config.multiplexer.program.clone()));
    let gateway = spawn_gateway(&listen, mux, config.gateway_settings())
        .await
        .map_err(|e| format!("cannot listen on {listen}: {e}"))?;
    info!(
        addr = %gateway.local_addr(),
        build = %startup_metadata_line(),
        "tabmux gateway started"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot wait for ctrl-c; stopping");
    }
    gateway.shutdown().await;
    Ok(())
}

async fn list(config: &Config) -> Result<(), String> {
    let mux = TmuxControl::new(config.multiplexer.program.clone());
    let names = mux.list_sessions().await.map_err(|e| e.to_string())?;
    if names.is_empty() {
        println!("no multiplexer sessions");
        return Ok(());
    }
    for name in names {
        match mux.query_pane_state(&name).await {
            Ok(state) => println!("{name}\twindows={}", state.window_count),
            Err(e) => println!("{name}\t({e})"),
        }
    }
    Ok(())
}

/// Close through a running gateway so every window hears about it; without
/// one, kill through the adapter directly.
async fn kill(config: &Config, name: &str) -> Result<(), String> {
    let mut client = match GatewayClient::connect(&config.gateway.listen).await {
        Ok(client) => client,
        Err(e) => {
            info!(error = %e, "no gateway; killing through tmux directly");
            let mux = TmuxControl::new(config.multiplexer.program.clone());
            mux.kill(name).await.map_err(|e| e.to_string())?;
            println!("killed {name}");
            return Ok(());
        }
    };
    let request = ClientMessage::correlated(
        format!("cli-kill-{}", std::process::id()),
        ClientPayload::Close(CloseRequest {
            connection_handle: None,
            multiplexer_session_name: Some(name.to_string()),
        }),
    );
    let reply = client
        .request(request, KILL_REPLY_TIMEOUT)
        .await
        .map_err(|e| e.to_string())?;
    match reply.payload {
        ServerPayload::Closed(closed) => {
            println!("killed {}", closed.multiplexer_session_name);
            Ok(())
        }
        ServerPayload::Error(error) => Err(error.reason),
        other => Err(format!("unexpected gateway reply: {other:?}")),
    }
}
