use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok(data)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DesiredUpdateRequest {
    /// JSON merge patch applied to the desired state
    pub patch: Value,
    /// Reject the write unless the twin is still at this version
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub outcome: String,
    pub version: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub registered: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub device_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TwinListQuery {
    pub farm_id: Option<String>,
}
