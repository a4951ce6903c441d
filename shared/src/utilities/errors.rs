use axum::{Json, http::StatusCode, response::IntoResponse, response::Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error, {0}")]
    ConfigError(String),
    #[error("IO error, {0}")]
    IoError(#[from] std::io::Error),
    #[error("YAML error, {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Serde json error, {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("HTTP request error, {0}")]
    Request(#[from] reqwest::Error),
    #[error("MongoDB error, {0}")]
    MongoError(#[from] mongodb::error::Error),
    #[error("BSON serialization error, {0}")]
    BsonSerError(#[from] mongodb::bson::ser::Error),
    #[error("BSON deserialization error, {0}")]
    BsonDeError(#[from] mongodb::bson::de::Error),
    #[error("Kafka error, {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),
    #[error("Kube error, {0}")]
    KubeError(#[from] kube::Error),
    #[error("KubeconfigError, {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),
    #[error("InfluxDB responded {status}: {body}")]
    InfluxApiError { status: u16, body: String },
    #[error("{0}")]
    NotFoundError(String),
    #[error("Unauthorized access")]
    UnauthorizedError,
    #[error("Upstream responded {0}")]
    UpstreamStatus(u16),
    #[error("Not implemented")]
    NotImplementedError,
    #[error("Internal error, {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            // The auth contract: 401 with a fixed error body.
            Self::UnauthorizedError => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized access"})),
            )
                .into_response(),
            // Unknown entities answer an empty JSON object, not an error body.
            Self::NotFoundError(_) => {
                (StatusCode::NOT_FOUND, Json(json!({}))).into_response()
            }
            // Proxy endpoints forward the upstream status with an opaque empty body.
            Self::UpstreamStatus(status) => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                Json(json!({})),
            )
                .into_response(),
            Self::NotImplementedError => {
                (StatusCode::NOT_IMPLEMENTED, Json(json!({}))).into_response()
            }
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": other.to_string()})),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn unauthorized_uses_fixed_error_body() {
        let response = AppError::UnauthorizedError.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"error": "Unauthorized access"}));
    }

    #[tokio::test]
    async fn upstream_status_is_forwarded_with_empty_body() {
        let response = AppError::UpstreamStatus(503).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({}));
    }
}
