//! REST API server.
//!
//! An HTTP façade over the [`Dispatcher`](crate::dispatch::Dispatcher):
//! routes parse path parameters and bodies, the dispatcher does the work,
//! and [`Error`](crate::error::Error) values become a status code plus an
//! `{"error": "..."}` body.
//!
//! # Security
//!
//! - Localhost only by default
//! - CORS restricted by default
//! - Error detail from the system bus is sanitized
//!
//! # Usage
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//! swagger_ui = true
//! ```

mod handlers;
mod routes;
pub mod state;

pub use handlers::{ErrorResponse, HealthResponse};
pub use routes::{create_router, ApiDoc};
pub use state::ApiState;

use crate::config::ServerConfig;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Start the API server and run until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    config: &ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid API bind address '{}': {}", config.bind, e))?;

    let router = create_router(state, config);

    let listener = TcpListener::bind(addr).await?;
    info!("Starting REST API server on {}", listener.local_addr()?);
    if config.swagger_ui {
        info!("Swagger UI available at http://{}/swagger-ui/", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("API server error: {}", e);
            anyhow::anyhow!("API server error: {}", e)
        })
}
