//! REST API server module.
//!
//! Provides HTTP endpoints for submitting chat messages and polling
//! reply jobs.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState, build_router};
