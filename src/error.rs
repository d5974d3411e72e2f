use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid date `{0}`: expected YYYY-MM-DD")]
    DateFormatInvalid(String),

    #[error("{0} is required")]
    DateMissing(&'static str),

    #[error("reconciliation already in progress for window {0}")]
    AlreadyRunning(String),

    #[error("batch {0} not found")]
    BatchNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("store unavailable: {0}")]
    StoreUnavailable(anyhow::Error),

    #[error("persist failed: {0}")]
    PersistFailed(anyhow::Error),

    #[error("internal error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable kind name surfaced in response bodies and error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DateFormatInvalid(_) => "DateFormatInvalid",
            Self::DateMissing(_) => "DateMissing",
            Self::AlreadyRunning(_) => "AlreadyRunning",
            Self::BatchNotFound(_) => "BatchNotFound",
            Self::BadRequest(_) => "BadRequest",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::PersistFailed(_) => "PersistFailed",
            Self::InternalError(_) => "InternalError",
            Self::ConfigError(_) => "ConfigError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DateFormatInvalid(_) | Self::DateMissing(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AlreadyRunning(_) => StatusCode::CONFLICT,
            Self::BatchNotFound(_) => StatusCode::NOT_FOUND,
            Self::StoreUnavailable(_)
            | Self::PersistFailed(_)
            | Self::InternalError(_)
            | Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::StoreUnavailable(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
            message: String,
        }

        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        }
        crate::services::metrics::record_error(self.kind());

        (
            status,
            Json(ErrorResponse {
                error: self.kind(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}
