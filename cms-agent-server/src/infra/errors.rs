use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use cms_agent_core::{AgentError, PersistenceError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<AgentError> for AppError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Configuration(msg) => Self::bad_request(msg),
            AgentError::Persistence(err) => err.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        match &err {
            PersistenceError::Read { path, source }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Self::not_found(format!(
                    "no published dataset at {}",
                    path.display()
                ))
            }
            _ => {
                tracing::error!(error = ?err, "storage operation failed");
                Self::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_dataset_maps_to_not_found() {
        let err = PersistenceError::Read {
            path: PathBuf::from("cms_data/cms_full_dataset.json"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::NOT_FOUND);
        assert!(app.message.contains("cms_full_dataset.json"));
    }

    #[test]
    fn configuration_errors_are_client_errors() {
        let app: AppError =
            AgentError::Configuration("poll interval must be greater than zero".into())
                .into();
        assert_eq!(app.status, StatusCode::BAD_REQUEST);
    }
}
