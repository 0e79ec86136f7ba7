pub mod appresult;
pub mod chat;
pub mod config;
pub mod db;

use axum::{extract::FromRef, http::{header, HeaderName, Method}, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};

pub use appresult::{AppError, AppResult};

use chat::{Ingestor, Registry};
use config::Config;
use db::Store;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub registry: Registry,
    pub ingestor: Ingestor,
}

impl AppState {
    /// Wires a fresh registry to `store`. Cancelling `shutdown` ends every
    /// connection's read loop.
    pub fn new(store: Store, config: &Config, shutdown: CancellationToken) -> Self {
        let registry = Registry::new();
        let ingestor = Ingestor::new(store.clone(), registry.clone(), shutdown, config);

        Self { store, registry, ingestor }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(chat::router())
        .with_state(state)
        .layer(cors())
        .layer(TraceLayer::new_for_http())
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ])
}
