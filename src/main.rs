//! rbacscan development backend
//!
//! In-memory implementation of the REST surface the client talks to.
//! Nothing survives a restart.
//!
//! Usage:
//!   ADMIN_EMAILS=root@example.com cargo run --bin rbacscan-devserver
//!   cargo run --bin seed_demo     # populate it through the client library

use tokio::net::TcpListener;

use rbacscan::config::ServerConfig;
use rbacscan::logging::init_tracing;
use rbacscan::server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_tracing("rbacscan-devserver", false, None);
    let config = ServerConfig::from_env()?;
    let addr = config.addr.clone();

    tracing::info!(%addr, admins = config.admin_emails.len(), "starting development backend");
    if config.jwt_secret == ServerConfig::default().jwt_secret {
        tracing::warn!("JWT_SECRET not set, using the built-in development secret");
    }

    let app = create_router(AppState::new(config));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
