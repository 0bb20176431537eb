use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Source store error: {0}")]
    SourceStoreError(String),

    #[error("Target store error: {0}")]
    TargetStoreError(String),

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Transform failed: {0}")]
    TransformError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Traffic routing error: {0}")]
    TrafficRoutingError(String),

    #[error("Rollout already in progress for domain {0}")]
    RolloutInProgress(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Alert delivery failed: {0}")]
    AlertDeliveryFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::ConfigError(format!("YAML error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::HealthCheckFailed(format!("request timed out: {}", err))
        } else {
            AppError::HealthCheckFailed(format!("request failed: {}", err))
        }
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::TargetStoreError(format!("MongoDB error: {}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::ConfigError(_) | AppError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RolloutInProgress(_) => StatusCode::CONFLICT,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::HealthCheckFailed(_)
            | AppError::TrafficRoutingError(_)
            | AppError::AlertDeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::EncryptionError(_) => {
                return internal_response("Internal encryption error".to_string())
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

fn internal_response(message: String) -> Response {
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    let body = Json(json!({
        "error": message,
        "status": status.as_u16(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }));
    (status, body).into_response()
}

pub type Result<T> = std::result::Result<T, AppError>;
