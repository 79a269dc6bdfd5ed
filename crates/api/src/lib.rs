//! HTTP request gateway.
//!
//! Translates the public `/api/v1` surface into replicated commands
//! and local reads. The gateway is stateless apart from its handle to
//! the consensus node; leader-only enforcement happens in the
//! consensus layer and surfaces here as a 503 with the leader's
//! address.

pub mod error;
pub mod handlers;

pub use error::ApiError;

use axum::routing::{get, post};
use axum::Router;
use raft::ConsensusNode;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<ConsensusNode>,
}

impl AppState {
    pub fn new(node: Arc<ConsensusNode>) -> Self {
        Self { node }
    }
}

/// Build the versioned API router.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route(
            "/printers",
            post(handlers::create_printer).get(handlers::list_printers),
        )
        .route("/printers/:id", get(handlers::get_printer))
        .route(
            "/filaments",
            post(handlers::create_filament).get(handlers::list_filaments),
        )
        .route("/filaments/:id", get(handlers::get_filament))
        .route(
            "/print_jobs",
            post(handlers::create_print_job).get(handlers::list_print_jobs),
        )
        .route("/print_jobs/:id", get(handlers::get_print_job))
        .route(
            "/print_jobs/:id/status",
            post(handlers::update_print_job_status),
        )
        .route("/join", post(handlers::join_cluster))
        .route("/cluster", get(handlers::cluster_info));

    Router::new().nest("/api/v1", v1).with_state(state)
}
