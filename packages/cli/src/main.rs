// ABOUTME: mockbox binary: runs the orchestrator API, proxy and reaper, or a single mock service
// ABOUTME: `serve-mock` is the child entry point used by the process launcher

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use mockbox_orchestrator::{
    create_router, mock_router, AppState, OrchestratorSettings, RenderedArtifact, TtlReaper,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::ServerConfig;
use mockbox_config::constants::RUST_LOG;

const DEFAULT_LOG_FILTER: &str = "mockbox_cli=info,mockbox_orchestrator=info,tower_http=info";

#[derive(Parser)]
#[command(name = "mockbox")]
#[command(about = "Mockbox - on-demand sandboxes of mock third-party APIs")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator API, proxy and reaper
    Serve {
        #[arg(long, help = "API server port (overrides MOCKBOX_API_PORT)")]
        port: Option<u16>,
        #[arg(long, help = "Skip adopting services from a previous run")]
        no_recover: bool,
    },
    /// Serve one rendered mock artifact (spawned by the process launcher)
    ServeMock {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { port, no_recover } => match ServerConfig::from_env() {
            Ok(mut config) => {
                config.log_json |= cli.log_json;
                if let Some(port) = port {
                    config.port = port;
                }
                init_tracing(config.log_json);
                serve(config, !no_recover).await
            }
            Err(e) => Err(e.into()),
        },
        Commands::ServeMock { artifact, port } => {
            init_tracing(cli.log_json);
            serve_mock(artifact, port).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_env(RUST_LOG).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: ServerConfig, recover: bool) -> anyhow::Result<()> {
    let settings = OrchestratorSettings::from_env().context("invalid orchestrator settings")?;
    let service = mockbox_orchestrator::init(settings).await?;

    if recover {
        match service.recover().await {
            Ok(report) if report.restored > 0 => {
                info!("Restored {} sandboxes from the previous run", report.restored)
            }
            Ok(_) => {}
            Err(e) => warn!("Sandbox recovery failed, starting empty: {}", e),
        }
    }

    let reaper = TtlReaper::new(service.clone());
    let shutdown = reaper.cancellation_token();
    let reaper_handle = reaper.spawn();

    let cors = CorsLayer::new()
        .allow_origin(config.cors_origin.parse::<HeaderValue>()?)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);

    let app = create_router(AppState::new(service.clone())).layer(cors);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Mockbox listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = reaper_handle.await {
        error!("Reaper task ended abnormally: {}", e);
    }

    let stopped = service.shutdown_all().await;
    info!("Shut down {} sandboxes", stopped);
    Ok(())
}

/// Resolves on Ctrl-C, SIGTERM or cancellation so `serve` can stop every sandbox first.
async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = terminate_signal() => info!("Shutdown signal received"),
        _ = token.cancelled() => {}
    }
}

async fn serve_mock(artifact_path: PathBuf, port: u16) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&artifact_path)
        .await
        .with_context(|| format!("failed to read artifact {:?}", artifact_path))?;
    let artifact: RenderedArtifact =
        serde_json::from_str(&raw).context("artifact is not valid JSON")?;

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        "Serving mock {} ({} endpoints) on {}",
        artifact.service_name,
        artifact.endpoints.len(),
        addr
    );

    axum::serve(listener, mock_router(artifact))
        .with_graceful_shutdown(terminate_signal())
        .await?;
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
