use axum::{
    Json,
    extract::{Path, State},
};
use canopy_core::{ApprovalRequest, Device, DeviceId, PendingRegistration};
use tracing::info;

use super::{
    error::ApiError,
    models::{ApiResponse, RefreshResponse, RemovedResponse},
};
use crate::{AppState, registry::DeviceRepository, transport::CommandTransport};

pub async fn list_pending<R, T>(
    State(state): State<AppState<R, T>>,
) -> Json<ApiResponse<Vec<PendingRegistration>>>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    Json(ApiResponse::ok(state.ledger.list_pending().await))
}

pub async fn approve<R, T>(
    State(state): State<AppState<R, T>>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<ApiResponse<Device>>, ApiError>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let device = state.ledger.approve(request).await?;
    info!(device_id = %device.id, "approved via API");

    let message = format!("Device {} registered to farm {}", device.id, device.farm_id);
    Ok(Json(ApiResponse::with_message(device, message)))
}

pub async fn reject<R, T>(
    Path(id): Path<String>,
    State(state): State<AppState<R, T>>,
) -> Json<ApiResponse<RemovedResponse>>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    state.ledger.reject(&DeviceId::new(id.as_str())).await;

    Json(ApiResponse::with_message(
        RemovedResponse { device_id: id },
        "Device rejected",
    ))
}

pub async fn remove<R, T>(
    Path(id): Path<String>,
    State(state): State<AppState<R, T>>,
) -> Result<Json<ApiResponse<RemovedResponse>>, ApiError>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    if !state.ledger.remove(&DeviceId::new(id.as_str())).await? {
        return Err(ApiError::NotFound(format!("Device {id} is not registered")));
    }

    Ok(Json(ApiResponse::with_message(
        RemovedResponse { device_id: id },
        "Device removed",
    )))
}

pub async fn refresh<R, T>(
    State(state): State<AppState<R, T>>,
) -> Json<ApiResponse<RefreshResponse>>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    let registered = state.ledger.refresh_cache().await;
    Json(ApiResponse::ok(RefreshResponse { registered }))
}
