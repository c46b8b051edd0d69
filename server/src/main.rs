use std::error::Error;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use huddle_server::config::{generate_config_template, Config};
use huddle_server::rooms::Registry;
use huddle_server::ws::CLOSE_GOING_AWAY;
use huddle_server::{routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    init_tracing(config.json_logs);

    tracing::info!("Huddle server v{} starting", env!("CARGO_PKG_VERSION"));

    // One registry for the life of the process, shared by every session
    let registry = Registry::new();
    let app_state = state::AppState::new(registry.clone(), &config);

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        default_room = %config.default_room,
        max_message_size_kb = config.max_message_size_kb,
        "Listening on {}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Initialize tracing/logging: pretty by default, JSON for Docker/production.
fn init_tracing(json_logs: bool) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("huddle_server=info"))
    };

    if json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter()).init();
    }
}

/// Resolve on Ctrl-C or SIGTERM, then ask every live session to close.
async fn shutdown_signal(registry: Registry) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    registry.close_all(CLOSE_GOING_AWAY, "Server shutting down");
}
