//! HTTP application wiring (Axum router + service wiring).
//!
//! Structure:
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses
//! - `adapters.rs`: dev defaults for the outbound ports

use axum::{Extension, Router, routing::get};

use dunning_infra::DunningService;

pub mod adapters;
pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(service: DunningService) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/dunning", routes::dunning::router())
        .layer(Extension(service))
}
