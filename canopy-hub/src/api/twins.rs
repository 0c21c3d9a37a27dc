use axum::{
    Json,
    extract::{Path, Query, State},
};
use canopy_core::{DeviceId, FarmId, Twin};

use super::{
    error::ApiError,
    models::{ApiResponse, DesiredUpdateRequest, IngestRequest, IngestResponse, TwinListQuery},
};
use crate::{
    AppState,
    ingest::Outcome,
    registry::DeviceRepository,
    transport::CommandTransport,
    twin::{SyncError, patch_from_value},
};

pub async fn list_twins<R, T>(
    Query(params): Query<TwinListQuery>,
    State(state): State<AppState<R, T>>,
) -> Json<ApiResponse<Vec<Twin>>>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let farm_id = params.farm_id.map(FarmId::new);
    let twins = state.synchronizer.store().list(farm_id.as_ref()).await;
    Json(ApiResponse::ok(twins))
}

pub async fn get_twin<R, T>(
    Path(id): Path<String>,
    State(state): State<AppState<R, T>>,
) -> Result<Json<ApiResponse<Twin>>, ApiError>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let id = DeviceId::new(id);
    let twin = state
        .synchronizer
        .store()
        .get(&id)
        .await
        .ok_or_else(|| SyncError::TwinNotFound(id.clone()))?;

    Ok(Json(ApiResponse::ok(twin)))
}

pub async fn update_desired<R, T>(
    Path(id): Path<String>,
    State(state): State<AppState<R, T>>,
    Json(request): Json<DesiredUpdateRequest>,
) -> Result<Json<ApiResponse<Twin>>, ApiError>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let id = DeviceId::new(id);
    let patch = patch_from_value(request.patch)?;

    let twin = match request.expected_version {
        Some(expected) => {
            state
                .synchronizer
                .set_desired_checked(&id, &patch, expected)
                .await?
        }
        None => state.synchronizer.set_desired(&id, &patch).await?,
    };

    Ok(Json(ApiResponse::ok(twin)))
}

pub async fn sync_twin<R, T>(
    Path(id): Path<String>,
    State(state): State<AppState<R, T>>,
) -> Result<Json<ApiResponse<Twin>>, ApiError>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let twin = state.synchronizer.push_desired(&DeviceId::new(id)).await?;
    Ok(Json(ApiResponse::ok(twin)))
}

pub async fn ingest<R, T>(
    State(state): State<AppState<R, T>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<ApiResponse<IngestResponse>>, ApiError>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let payload = serde_json::to_vec(&request.payload)
        .map_err(|e| ApiError::BadRequest(format!("Invalid payload: {e}")))?;

    let outcome = state.ingestor.handle(&request.topic, &payload).await?;
    let (outcome, version) = match outcome {
        Outcome::Announced => ("announced", None),
        Outcome::Unregistered => ("unregistered", None),
        Outcome::Reported(twin) => ("reported", Some(twin.metadata.version)),
        Outcome::Disconnected(twin) => ("disconnected", Some(twin.metadata.version)),
        Outcome::Seen => ("seen", None),
        Outcome::Ignored => ("ignored", None),
    };

    Ok(Json(ApiResponse::ok(IngestResponse {
        outcome: outcome.to_owned(),
        version,
    })))
}
