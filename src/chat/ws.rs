use axum::{debug_handler, extract::{State, WebSocketUpgrade}, response::IntoResponse};
use futures_util::StreamExt;
use tracing::warn;

use super::ingest::Ingestor;

#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_ws(
    State(ingestor): State<Ingestor>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(ingestor.max_message_size())
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sender, receiver) = socket.split();
            ingestor.serve(sender, receiver).await;
        })
}
