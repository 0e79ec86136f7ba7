use anyhow::Context;
use chatrelay::{app, config::Config, db::Store, AppState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;

    let store = Store::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("couldn't open {}", config.database_url))?;
    store.create_schema().await.context("couldn't create schema")?;

    let shutdown = shutdown_token();
    let app_state = AppState::new(store.clone(), &config, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("couldn't bind {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    store.close().await;
    info!("shut down");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatrelay=debug,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();

    let cloned = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                cloned.cancel();
            }
            Err(e) => warn!(error = %e, "unable to listen for shutdown signal"),
        }
    });

    token
}
