use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use plinth_core::admission::AdmissionGovernor;
use plinth_core::control::ControlChannel;
use plinth_core::egress::EgressPublisher;
use plinth_core::registry::SessionRegistry;
use plinth_core::service::{ServiceConfig, StreamService};
use plinth_core::supervisor::{SupervisorConfig, WorkerSupervisor};
use plinth_core::worker::{find_renderer_binary, ProcessLauncher, WorkerLauncher};

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plinth=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    // ── Renderer binary probe ────────────────────────────────────────────────
    let renderer_binary = find_renderer_binary(&config.renderer.binary);
    let renderer_available = renderer_binary.is_some();
    match &renderer_binary {
        Some(path) => tracing::info!("Found renderer binary at: {}", path.display()),
        None => {
            tracing::warn!("==========================================================");
            tracing::warn!("  Renderer binary '{}' not found!", config.renderer.binary);
            tracing::warn!("  Stream starts will fail until it is installed.");
            tracing::warn!("");
            tracing::warn!("  Place the binary next to the plinth-server executable");
            tracing::warn!("  or point [renderer] binary at it in the config file.");
            tracing::warn!("==========================================================");
        }
    }

    // ── Core components ──────────────────────────────────────────────────────
    let registry = Arc::new(SessionRegistry::new());
    let governor = Arc::new(AdmissionGovernor::new(config.stream.max_sessions));
    let control = Arc::new(ControlChannel::new(config.stream.control_queue_depth));
    let egress = Arc::new(EgressPublisher::new(config.server.public_host.clone()));

    let launcher = WorkerLauncher::Process(ProcessLauncher {
        binary: renderer_binary.unwrap_or_else(|| PathBuf::from(&config.renderer.binary)),
        args: config.renderer.args.clone(),
    });
    let supervisor = Arc::new(WorkerSupervisor::new(
        launcher,
        Arc::clone(&registry),
        Arc::clone(&governor),
        Arc::clone(&control),
        Arc::clone(&egress),
        SupervisorConfig {
            launch_timeout: Duration::from_secs(config.renderer.launch_timeout_secs),
            heartbeat_grace: Duration::from_secs(config.renderer.heartbeat_grace_secs),
            max_restarts: config.renderer.max_restarts,
            restart_backoff: Duration::from_millis(config.renderer.restart_backoff_ms),
            graceful_wait: Duration::from_secs(config.renderer.graceful_wait_secs),
        },
    ));

    let service = Arc::new(StreamService::new(
        registry,
        governor,
        supervisor,
        control,
        egress,
        ServiceConfig {
            idle_timeout: Duration::from_secs(config.stream.idle_timeout_secs),
            sweep_interval: Duration::from_secs(config.stream.sweep_interval_secs),
            terminal_retention: Duration::from_secs(config.stream.terminal_retention_secs),
        },
    ));
    let sweeper = service.spawn_sweeper();

    let state = plinth_core::AppState {
        service: Arc::clone(&service),
        config: plinth_core::AppConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            jwt_expiry_seconds: config.auth.jwt_expiry_seconds,
            renderer_available,
        },
    };

    let app = plinth_api::build_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;

    tracing::info!("Plinth relay listening on {}", config.server.bind_address);
    tracing::info!(
        max_sessions = config.stream.max_sessions,
        idle_timeout_secs = config.stream.idle_timeout_secs,
        renderer_available,
        "session limits"
    );

    // Graceful shutdown: stop every session so no renderer outlives us.
    let shutdown_service = Arc::clone(&service);
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down (ctrl-c)...");
        shutdown_service.shutdown().await;
        sweeper.abort();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}
