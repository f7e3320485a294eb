//! API route modules.
//!
//! Organizes routes by resource type.

pub mod chat;
pub mod health;
pub mod status;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(chat::router())
        .merge(status::router())
        .nest("/health", health::router())
        .with_state(state)
}
