use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{ingest::IngestError, ledger::LedgerError, twin::SyncError};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, error) = match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Conflict(msg) => {
                (msg, None)
            }
            ApiError::ServiceUnavailable(detail) => {
                ("Device repository unavailable".to_owned(), Some(detail))
            }
        };

        let error_response = ErrorResponse {
            success: false,
            message,
            error,
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Validation { .. } => ApiError::BadRequest(e.to_string()),
            LedgerError::AlreadyRegistered(_) => ApiError::Conflict(e.to_string()),
            LedgerError::Repository(_) => ApiError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::TwinNotFound(_) => ApiError::NotFound(e.to_string()),
            SyncError::VersionConflict { .. } => ApiError::Conflict(e.to_string()),
            SyncError::InvalidPatch => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Sync(e) => e.into(),
            IngestError::Payload { .. }
            | IngestError::NotAnObject { .. }
            | IngestError::EmptyField { .. } => ApiError::BadRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use canopy_core::DeviceId;

    use super::*;
    use crate::registry::RepositoryError;

    #[test]
    fn ledger_errors_map_to_status() {
        let cases = [
            (LedgerError::Validation { field: "name" }, StatusCode::BAD_REQUEST),
            (
                LedgerError::AlreadyRegistered(DeviceId::from("c1")),
                StatusCode::CONFLICT,
            ),
            (
                LedgerError::Repository(RepositoryError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn sync_errors_map_to_status() {
        assert_eq!(
            ApiError::from(SyncError::TwinNotFound(DeviceId::from("c1"))).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(SyncError::VersionConflict {
                expected: 1,
                current: 2
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SyncError::InvalidPatch).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
