use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use shared::utilities::auth::require_basic_auth;
use shared::utilities::errors::AppError;

use crate::query_engine::{QueryEngine, QueryParams};

pub const SERRANO_DEPLOYMENTS_BUCKET: &str = "SERRANO_Deployments";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    /// Optional cluster_uuid -> bucket mapping; absent, the requested UUID
    /// is used as the bucket name directly.
    pub buckets: Option<HashMap<String, String>>,
}

impl AppState {
    fn bucket_for(&self, cluster_uuid: &str) -> Option<String> {
        match &self.buckets {
            Some(buckets) => buckets.get(cluster_uuid).cloned(),
            None => Some(cluster_uuid.to_owned()),
        }
    }
}

fn unknown_cluster() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Bad request - Unable to find specified cluster UUID"})),
    )
        .into_response()
}

fn missing_namespace() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Bad request - Missing required namespace parameter"})),
    )
        .into_response()
}

async fn get_pods_metrics(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let Some(bucket) = state.bucket_for(&cluster_uuid.to_string()) else {
        return Ok(unknown_cluster());
    };
    if params.namespace.is_none() {
        return Ok(missing_namespace());
    }
    let data = state.engine.query_pods(&bucket, &params).await?;
    Ok(Json(data).into_response())
}

async fn get_persistent_volumes_metrics(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let Some(bucket) = state.bucket_for(&cluster_uuid.to_string()) else {
        return Ok(unknown_cluster());
    };
    let data = state.engine.query_persistent_volumes(&bucket, &params).await?;
    Ok(Json(data).into_response())
}

async fn get_deployments_metrics(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let Some(bucket) = state.bucket_for(&cluster_uuid.to_string()) else {
        return Ok(unknown_cluster());
    };
    if params.namespace.is_none() {
        return Ok(missing_namespace());
    }
    let data = state.engine.query_deployments(&bucket, &params).await?;
    Ok(Json(data).into_response())
}

async fn get_nodes_metrics(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let Some(bucket) = state.bucket_for(&cluster_uuid.to_string()) else {
        return Ok(unknown_cluster());
    };
    let data = state.engine.query_nodes(&bucket, &params).await?;
    Ok(Json(data).into_response())
}

async fn get_edge_storage_devices_metrics(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let Some(bucket) = state.bucket_for(&cluster_uuid.to_string()) else {
        return Ok(unknown_cluster());
    };
    let data = state
        .engine
        .query_edge_storage_devices(&bucket, &params)
        .await?;
    Ok(Json(data).into_response())
}

async fn get_serrano_deployments_metrics(
    State(state): State<AppState>,
    Path(deployment_uuid): Path<Uuid>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let data = state
        .engine
        .query_serrano_deployments(
            &deployment_uuid.to_string(),
            SERRANO_DEPLOYMENTS_BUCKET,
            &params,
        )
        .await?;
    Ok(Json(data).into_response())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/pmds/pods/{cluster_uuid}", get(get_pods_metrics))
        .route(
            "/api/v1/pmds/pvs/{cluster_uuid}",
            get(get_persistent_volumes_metrics),
        )
        .route(
            "/api/v1/pmds/deployments/{cluster_uuid}",
            get(get_deployments_metrics),
        )
        .route("/api/v1/pmds/nodes/{cluster_uuid}", get(get_nodes_metrics))
        .route(
            "/api/v1/pmds/edge_storage_devices/{cluster_uuid}",
            get(get_edge_storage_devices_metrics),
        )
        .route(
            "/api/v1/pmds/serrano_deployments/{deployment_uuid}",
            get(get_serrano_deployments_metrics),
        )
        .layer(middleware::from_fn(require_basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, header};
    use shared::services::influx::Influx;
    use tower::ServiceExt;

    const AUTH: &str = "Basic c2VycmFubzo="; // "serrano:"

    fn test_state(buckets: Option<HashMap<String, String>>) -> AppState {
        let influx = Influx::with_endpoint("http://127.0.0.1:1", "serrano", "token").unwrap();
        AppState {
            engine: Arc::new(QueryEngine::new(influx)),
            buckets,
        }
    }

    #[tokio::test]
    async fn pods_require_a_namespace_parameter() {
        let response = app(test_state(None))
            .oneshot(
                HttpRequest::get("/api/v1/pmds/pods/7d9b0b42-22e9-4f2d-8f68-2b6a36a4f5d3")
                    .header(header::AUTHORIZATION, AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value["error"],
            "Bad request - Missing required namespace parameter"
        );
    }

    #[tokio::test]
    async fn clusters_outside_the_bucket_map_are_rejected() {
        let response = app(test_state(Some(HashMap::new())))
            .oneshot(
                HttpRequest::get("/api/v1/pmds/nodes/7d9b0b42-22e9-4f2d-8f68-2b6a36a4f5d3")
                    .header(header::AUTHORIZATION, AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_without_credentials_are_rejected() {
        let response = app(test_state(None))
            .oneshot(
                HttpRequest::get("/api/v1/pmds/nodes/7d9b0b42-22e9-4f2d-8f68-2b6a36a4f5d3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
