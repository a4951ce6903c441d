use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use shared::models::RuntimeOptions;
use shared::schemas::{
    DeploymentDoc, KernelDeploymentUpdate, KernelMetricsPost, RuntimeOptionsUpdate,
    ServiceConfigView,
};
use shared::utilities::auth::require_basic_auth;
use shared::utilities::config::RestInterfaceConfig;
use shared::utilities::errors::AppError;

use crate::data_engine::CentralEngine;

#[derive(Clone)]
pub struct AppState {
    pub handler_uuid: String,
    pub engine: Arc<CentralEngine>,
    pub options: Arc<Mutex<RuntimeOptions>>,
    pub rest_interface: RestInterfaceConfig,
    pub gateway_address: String,
    pub http: reqwest::Client,
}

impl AppState {
    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.options.lock().unwrap().query_timeout.max(1))
    }
}

fn forwarded_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

// ============================================
// CONFIGURATION
// ============================================

async fn get_configuration(State(state): State<AppState>) -> impl IntoResponse {
    let options = *state.options.lock().unwrap();
    Json(ServiceConfigView {
        address: state.rest_interface.address.clone(),
        port: state.rest_interface.port,
        exposed_service: state.rest_interface.exposed_service(),
        query_interval: options.query_interval,
        query_timeout: options.query_timeout,
        active_monitoring: options.active_monitoring,
    })
}

async fn put_configuration(
    State(state): State<AppState>,
    Json(update): Json<RuntimeOptionsUpdate>,
) -> impl IntoResponse {
    update.apply(&mut state.options.lock().unwrap());
    (StatusCode::CREATED, Json(json!({})))
}

// ============================================
// INFRASTRUCTURE
// ============================================

async fn get_infrastructure(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let data = state
        .engine
        .get_infrastructure(params.get("kernels").map(String::as_str))
        .await?;
    Ok(Json(data).into_response())
}

async fn get_infrastructure_inventory(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let data = state
        .engine
        .get_infrastructure_inventory(&cluster_uuid.to_string())
        .await?;
    Ok(Json(data).into_response())
}

async fn get_infrastructure_monitor(Path(_cluster_uuid): Path<Uuid>) -> impl IntoResponse {
    Json(json!({}))
}

// ============================================
// CLUSTERS
// ============================================

async fn get_clusters(State(state): State<AppState>) -> Result<Response, AppError> {
    Ok(Json(json!({"clusters": state.engine.get_clusters().await?})).into_response())
}

async fn get_cluster(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let cluster_uuid = cluster_uuid.to_string();
    let agents = state.engine.get_registered_agents().await?;
    if !agents.contains_key(&cluster_uuid) {
        return Err(AppError::NotFoundError(cluster_uuid));
    }
    let cluster = state.engine.get_cluster(&cluster_uuid).await?;
    Ok(Json(cluster.unwrap_or_else(|| json!({}))).into_response())
}

/// Live pull-through to the owning agent's mirrored probe endpoint.
async fn proxy_to_agent(
    state: &AppState,
    cluster_uuid: &str,
    endpoint: &str,
    target: Option<&str>,
) -> Result<Response, AppError> {
    let agents = state.engine.get_registered_agents().await?;
    let Some(route) = agents.get(cluster_uuid) else {
        return Err(AppError::NotFoundError(cluster_uuid.to_owned()));
    };

    let mut request = state
        .http
        .get(format!(
            "{}/api/v1/telemetry/agent/{endpoint}/{}",
            route.url, route.probe_uuid
        ))
        .basic_auth(&state.handler_uuid, Some(""))
        .timeout(state.query_timeout());
    if let Some(target) = target {
        request = request.query(&[("target", target)]);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            let payload: Value = response.json().await.unwrap_or_else(|_| json!({}));
            Ok((StatusCode::OK, Json(payload)).into_response())
        }
        Ok(response) => {
            Ok((forwarded_status(response.status()), Json(json!({}))).into_response())
        }
        Err(err) => {
            error!("Unable to reach agent of cluster '{cluster_uuid}': {err}");
            Ok((StatusCode::NOT_FOUND, Json(json!({}))).into_response())
        }
    }
}

async fn cluster_inventory(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    proxy_to_agent(&state, &cluster_uuid.to_string(), "inventory", None).await
}

async fn cluster_monitor(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    proxy_to_agent(
        &state,
        &cluster_uuid.to_string(),
        "monitor",
        params.get("target").map(String::as_str),
    )
    .await
}

async fn cluster_metrics(
    State(state): State<AppState>,
    Path(cluster_uuid): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let cluster_uuid = cluster_uuid.to_string();
    let agents = state.engine.get_registered_agents().await?;
    if !agents.contains_key(&cluster_uuid) {
        return Err(AppError::NotFoundError(cluster_uuid));
    }
    let metrics = state
        .engine
        .get_cluster_metrics(&cluster_uuid, params.get("target").map(String::as_str))
        .await?;
    Ok(Json(json!({"metrics": metrics})).into_response())
}

// ============================================
// STORAGE LOCATIONS
// ============================================

async fn get_storage_locations(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let data = state
        .engine
        .get_storage_locations(
            &state.http,
            &state.gateway_address,
            params.get("target").map(String::as_str),
        )
        .await?;
    Ok(Json(data).into_response())
}

// ============================================
// DEPLOYMENTS
// ============================================

async fn get_deployments(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let deployments = state
        .engine
        .get_serrano_deployments(params.get("deployment_uuid").map(String::as_str))
        .await?;
    Ok(Json(json!({"deployments": deployments})).into_response())
}

async fn post_deployment(
    State(state): State<AppState>,
    Json(deployment): Json<DeploymentDoc>,
) -> Result<Response, AppError> {
    state
        .engine
        .set_serrano_deployment(&state.http, deployment)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
}

async fn get_deployment(
    State(state): State<AppState>,
    Path(deployment_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let deployments = state
        .engine
        .get_serrano_deployments(Some(&deployment_uuid.to_string()))
        .await?;
    Ok(Json(json!({"deployments": deployments})).into_response())
}

async fn delete_deployment(
    State(state): State<AppState>,
    Path(deployment_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    state
        .engine
        .delete_serrano_deployment(&state.http, &deployment_uuid.to_string())
        .await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

async fn get_cluster_deployments(State(state): State<AppState>) -> Result<Response, AppError> {
    let data = state.engine.get_per_cluster_deployments().await?;
    Ok(Json(json!({"cluster_deployments": data})).into_response())
}

// ============================================
// KERNELS
// ============================================

async fn get_kernel_deployments(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let data = state
        .engine
        .get_kernel_deployments(params.get("deployment_mode").map(String::as_str))
        .await?;
    Ok(Json(data).into_response())
}

async fn put_kernel_deployments(
    State(state): State<AppState>,
    Json(update): Json<KernelDeploymentUpdate>,
) -> Result<Response, AppError> {
    state.engine.update_kernel_deployments(&update).await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
}

async fn get_kernel_metrics(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    Ok(Json(state.engine.get_kernel_metrics(&params).await?).into_response())
}

async fn post_kernel_metrics(
    State(state): State<AppState>,
    Json(body): Json<KernelMetricsPost>,
) -> Result<Response, AppError> {
    state.engine.add_kernel_metrics(body.logs).await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

// ============================================
// DEPLOYMENT METRICS
// ============================================

async fn get_deployment_specific_metrics(
    State(state): State<AppState>,
    Path(deployment_uuid): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let data = state
        .engine
        .get_deployment_specific_metrics(&deployment_uuid.to_string(), &params)
        .await?;
    Ok(Json(data).into_response())
}

async fn get_deployment_metrics(
    State(state): State<AppState>,
    Path(deployment_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let metrics = state
        .engine
        .get_deployment_metrics(&deployment_uuid.to_string())
        .await?;
    Ok(Json(json!({"metrics": metrics})).into_response())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/telemetry/central",
            get(get_configuration).put(put_configuration),
        )
        .route("/api/v1/telemetry/central/infrastructure", get(get_infrastructure))
        .route(
            "/api/v1/telemetry/central/infrastructure/inventory/{cluster_uuid}",
            get(get_infrastructure_inventory),
        )
        .route(
            "/api/v1/telemetry/central/infrastructure/monitor/{cluster_uuid}",
            get(get_infrastructure_monitor),
        )
        .route("/api/v1/telemetry/central/clusters", get(get_clusters))
        .route("/api/v1/telemetry/central/clusters/{cluster_uuid}", get(get_cluster))
        .route(
            "/api/v1/telemetry/central/clusters/inventory/{cluster_uuid}",
            get(cluster_inventory),
        )
        .route(
            "/api/v1/telemetry/central/clusters/monitor/{cluster_uuid}",
            get(cluster_monitor),
        )
        .route(
            "/api/v1/telemetry/central/clusters/metrics/{cluster_uuid}",
            get(cluster_metrics),
        )
        .route(
            "/api/v1/telemetry/central/storage_locations",
            get(get_storage_locations),
        )
        .route(
            "/api/v1/telemetry/central/deployments",
            get(get_deployments).post(post_deployment),
        )
        .route(
            "/api/v1/telemetry/central/deployments/{deployment_uuid}",
            get(get_deployment).delete(delete_deployment),
        )
        .route(
            "/api/v1/telemetry/central/cluster_deployments",
            get(get_cluster_deployments),
        )
        .route(
            "/api/v1/telemetry/central/serrano_kernel_deployments",
            get(get_kernel_deployments).put(put_kernel_deployments),
        )
        .route(
            "/api/v1/telemetry/central/kernel_metrics",
            get(get_kernel_metrics).post(post_kernel_metrics),
        )
        .route(
            "/api/v1/telemetry/central/deployment_specific_metrics/{deployment_uuid}",
            get(get_deployment_specific_metrics),
        )
        .route(
            "/api/v1/telemetry/central/deployment_metrics/{deployment_uuid}",
            get(get_deployment_metrics),
        )
        .layer(middleware::from_fn(require_basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
