pub mod chat;
pub mod store;

use axum::{
    extract::FromRef,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;

use crate::chat::registry::Registry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub registry: Registry,
}

/// Assemble the full service router. The web frontend lives on another
/// origin, so the HTTP surface is CORS-permissive.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(chat::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "service": "alumnet-chat" }))
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
