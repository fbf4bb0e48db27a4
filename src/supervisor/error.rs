//! Supervisor error taxonomy. Commands are fire-and-forget, so most of these
//! end up as console notices; the IPC layer maps the rest to HTTP status codes.

use axum::http::StatusCode;

use crate::archive::ArchiveError;

/// Errors raised while driving a supervised process.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch '{program}': {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive failed: {0}")]
    ArchiveFailure(#[from] ArchiveError),

    #[error("{0} is already running or starting")]
    AlreadyInProgress(String),

    #[error("tunnel connection failed: {0}")]
    ConnectionFailure(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("failed to signal process: {0}")]
    SignalFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyInProgress(_) | Self::NotRunning(_) => StatusCode::CONFLICT,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::ConnectionFailure(_) => StatusCode::BAD_GATEWAY,
            Self::LaunchFailure { .. }
            | Self::ArchiveFailure(_)
            | Self::SignalFailure(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LaunchFailure { .. } => "LAUNCH_FAILURE",
            Self::ArchiveFailure(_) => "ARCHIVE_FAILURE",
            Self::AlreadyInProgress(_) => "ALREADY_IN_PROGRESS",
            Self::ConnectionFailure(_) => "CONNECTION_FAILURE",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::SignalFailure(_) => "SIGNAL_FAILURE",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
