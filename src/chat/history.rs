use axum::{debug_handler, extract::State, Json};

use crate::{db::{HistoryEntry, Store}, AppResult};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    State(store): State<Store>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    Ok(Json(store.list_messages().await?))
}
