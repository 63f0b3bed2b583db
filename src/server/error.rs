use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::ml::session::LoadError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("No file was selected or found in the 'file' field.")]
    MissingFile,

    /// Malformed or oversized multipart body, with the status axum chose for it.
    #[error("Invalid request: {1}")]
    Rejected(StatusCode, String),

    #[error("Server error: the AI model could not be loaded ({0}). Try restarting the service.")]
    ModelUnavailable(#[from] LoadError),

    #[error("Error processing the image: {0}")]
    Processing(String),

    #[error("Error handling the uploaded file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Processing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingFile => StatusCode::BAD_REQUEST,
            AppError::Rejected(status, _) => *status,
            AppError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Processing(_) | AppError::Io(_) | AppError::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, message);
        }
        (status, message).into_response()
    }
}
