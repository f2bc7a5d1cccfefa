use std::fmt::{Display, Formatter};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::LabError;

#[derive(Debug)]
pub struct ApiError(anyhow::Error);

/// Errors that exist only at the HTTP layer.
#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("firmware_id is required")]
    MissingFirmwareId,
    #[error("instance '{0}' not found")]
    UnknownInstance(String),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let status = if let Some(http) = self.0.downcast_ref::<HttpError>() {
            match http {
                HttpError::MissingFirmwareId => StatusCode::BAD_REQUEST,
                HttpError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            }
        } else if let Some(lab) = self.0.downcast_ref::<LabError>() {
            match lab {
                LabError::UnknownFirmware(_) | LabError::MissingFile { .. } => {
                    StatusCode::NOT_FOUND
                }
                LabError::Config(_) => StatusCode::BAD_REQUEST,
                LabError::SocMacConflict(_) | LabError::Resource { .. } => {
                    error!("request failed: {}", message);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        } else {
            error!("request failed: {}", message);
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl<T> From<T> for ApiError
where
    T: Into<anyhow::Error>,
{
    fn from(t: T) -> Self {
        ApiError(t.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
