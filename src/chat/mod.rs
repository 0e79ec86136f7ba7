mod broadcast;
mod envelope;
mod history;
mod ingest;
mod registry;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use broadcast::{Broadcaster, Delivery};
pub use envelope::Envelope;
pub use ingest::{CloseReason, Ingestor};
pub use registry::{Connection, ConnectionId, Registry};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::chat_ws))
        .route("/api/messages", get(history::history))
}
