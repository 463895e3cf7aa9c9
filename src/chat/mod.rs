pub mod event;
mod gateway;
pub mod registry;
pub mod room;
mod ws;

use axum::{
    debug_handler,
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;

use self::registry::Registry;
use crate::{store, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::chat_ws))
        .route("/api/online_status", get(online_status))
        .route("/api/messages/{user1}/{user2}", get(message_history))
}

/// Snapshot of the presence registry, polled by clients that are not on
/// a socket (or that reconnected and need to resync their sidebar).
#[debug_handler(state = AppState)]
async fn online_status(State(registry): State<Registry>) -> Json<Value> {
    Json(json!({ "online_users": registry.snapshot() }))
}

/// Conversation history for a counterpart pair, oldest first.
#[debug_handler(state = AppState)]
async fn message_history(
    State(db_pool): State<SqlitePool>,
    Path((user1, user2)): Path<(i64, i64)>,
) -> AppResult<Json<Vec<store::StoredMessage>>> {
    Ok(Json(store::history(&db_pool, user1, user2).await?))
}
