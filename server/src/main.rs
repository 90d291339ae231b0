use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use channelhub_server::config::ServerConfig;
use channelhub_server::db::pool::{create_pool, run_migrations};
use channelhub_server::db::store::SqliteMessageStore;
use channelhub_server::engine::hub::Hub;
use channelhub_server::web::app_state::AppState;
use channelhub_server::web::identity::HeaderIdentity;
use channelhub_server::web::router::build_router;

#[derive(Debug, Parser)]
#[command(name = "channelhub", about = "Real-time channel chat server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "channelhub.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;

    // Initialize database
    let pool = create_pool(&config.database.url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let (hub, hub_task) = Hub::spawn(config.command_queue_capacity());

    let app_state = Arc::new(AppState {
        hub: hub.clone(),
        store: Arc::new(SqliteMessageStore::new(pool)),
        session: config.session_settings(),
        identity: Arc::new(HeaderIdentity),
        public_url: config.server.public_url.clone(),
    });

    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server.web_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.web_address))?;

    info!("Channelhub server listening on {}", config.server.web_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Closing every mailbox ends the sessions still in a channel.
    if let Err(e) = hub.shutdown().await {
        warn!(error = %e, "hub already stopped");
    }
    if let Err(e) = hub_task.await {
        warn!(error = %e, "hub task ended abnormally");
    }
    info!("Channelhub server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
