use crate::handlers::{call_tool, cancel_job, get_config, get_job, health_check, wait_job, SharedState};
use crate::middleware::logging_middleware;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the HTTP application around an already running dispatcher.
pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/tools/call", post(call_tool))
        .route("/jobs/:key", get(get_job).delete(cancel_job))
        .route("/jobs/:key/wait", post(wait_job))
        .route("/health", get(health_check))
        .route("/config", get(get_config))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(state: SharedState, bind_addr: SocketAddr) -> Self {
        Self {
            app: create_app(state),
            bind_addr,
        }
    }

    /// Serve until Ctrl+C or SIGTERM.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Calendar dispatch server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
