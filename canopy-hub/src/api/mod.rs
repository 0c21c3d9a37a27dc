pub mod coordinators;
pub mod error;
pub mod models;
pub mod twins;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};

use crate::{AppState, registry::DeviceRepository, transport::CommandTransport};

pub fn router<R, T>() -> Router<AppState<R, T>>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    Router::new()
        .route("/health", get(health))
        // Registration routes
        .route("/api/coordinators/pending", get(coordinators::list_pending::<R, T>))
        .route("/api/coordinators/register/approve", post(coordinators::approve::<R, T>))
        .route("/api/coordinators/refresh", post(coordinators::refresh::<R, T>))
        .route("/api/coordinators/{id}/reject", post(coordinators::reject::<R, T>))
        .route("/api/coordinators/{id}", delete(coordinators::remove::<R, T>))
        // Twin routes
        .route("/api/twins", get(twins::list_twins::<R, T>))
        .route("/api/twins/{id}", get(twins::get_twin::<R, T>))
        .route("/api/twins/{id}/desired", patch(twins::update_desired::<R, T>))
        .route("/api/twins/{id}/sync", post(twins::sync_twin::<R, T>))
        .route("/api/ingest", post(twins::ingest::<R, T>))
}

async fn health() -> &'static str {
    "OK"
}
