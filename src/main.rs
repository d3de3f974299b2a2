use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lifeguard::error::AppError;
use lifeguard::{AppState, Config, build_router, metrics, signal};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Logging comes up before a config error is reported, so fall back to defaults
    let (log_level, log_json) = match &config {
        Ok(config) => (config.log_level.as_str(), config.log_json),
        Err(_) => ("info", false),
    };
    init_tracing(log_level, log_json);

    info!("Starting lifeguard v{}", env!("CARGO_PKG_VERSION"));

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => {
            error!("Configuration error: {e}");
            Err(exitcode::CONFIG)
        }
    };

    match result {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        rate_limit = config.rate_limit,
        window_secs = config.rate_limit_window.as_secs(),
        request_timeout_ms = config.request_timeout.map(|t| t.as_millis()),
        store = if config.redis_url.is_some() { "redis" } else { "memory" },
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let state = AppState::new(config.clone()).await.map_err(|e| {
        error!("Failed to initialize application state: {e}");
        match e {
            AppError::Store(_) => exitcode::UNAVAILABLE,
            _ => exitcode::CONFIG,
        }
    })?;

    let app = build_router(state.clone()).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health        - Health check");
    info!("  GET  /limited       - Per-client rate limited");
    info!("  GET  /tenant        - Per-tenant rate limited (X-Tenant-Id)");
    info!("  GET  /slow?ms=N     - Cooperative sleep under the request deadline");
    info!("  GET  /panic         - Panic recovery");
    info!("  POST /echo          - Validated echo");

    // ConnectInfo feeds the peer address to the client IP dimension
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, draining in-flight handlers...");
    if let Err(e) = state.shutdown().await {
        warn!("Shutdown incomplete: {e}");
        return Err(exitcode::SOFTWARE);
    }

    info!("Server shutdown complete");
    Ok(())
}
