use crate::provider::ProviderError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced at the relay boundary, always serialized as `{"error": message}`
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Missing fingerprint data")]
    MissingPayload,

    #[error("Missing fingerprint data or backend data")]
    MissingBackendData,

    #[error("Configuration error: Missing API key")]
    MissingApiKey,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedBody(_)
            | ApiError::MissingPayload
            | ApiError::MissingBackendData => StatusCode::BAD_REQUEST,
            ApiError::MissingApiKey => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Provider(ProviderError::VendorError { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Relay request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "Rejected relay request");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::MissingPayload.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingBackendData.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingApiKey.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let vendor = ApiError::from(ProviderError::VendorError {
            status: 403,
            text: "Forbidden".to_string(),
        });
        assert_eq!(vendor.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(vendor.to_string(), "Fingerprint API error: 403, Forbidden");
    }
}
