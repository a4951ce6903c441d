use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use shared::models::{ProbeTarget, RuntimeOptions};
use shared::schemas::{
    AgentDeploymentsRequest, DeploymentSpecificMetrics, MonitorEnvelope, ProbeDescriptor,
    RegisterProbeRequest, RuntimeOptionsUpdate, ServiceConfigView,
};
use shared::utilities::auth::require_basic_auth;
use shared::utilities::config::RestInterfaceConfig;
use shared::utilities::errors::AppError;

use crate::controller::{DeploymentEvent, TelemetryEvent};

#[derive(Clone)]
pub struct AppState {
    pub agent_uuid: String,
    pub events: mpsc::Sender<TelemetryEvent>,
    pub registry: Arc<Mutex<HashMap<String, ProbeTarget>>>,
    pub options: Arc<Mutex<RuntimeOptions>>,
    pub rest_interface: RestInterfaceConfig,
    pub http: reqwest::Client,
}

impl AppState {
    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.options.lock().unwrap().query_timeout.max(1))
    }

    fn lookup(&self, entity_uuid: &str) -> Option<ProbeTarget> {
        self.registry.lock().unwrap().get(entity_uuid).cloned()
    }

    async fn emit(&self, event: TelemetryEvent) -> Result<(), AppError> {
        self.events
            .send(event)
            .await
            .map_err(|_| AppError::InternalError("telemetry controller is gone".to_owned()))
    }
}

fn forwarded_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

// ============================================
// ENTITY MANAGEMENT
// ============================================

async fn get_registered_entities(State(state): State<AppState>) -> impl IntoResponse {
    let entities: Vec<Value> = state
        .registry
        .lock()
        .unwrap()
        .iter()
        .map(|(probe_uuid, target)| {
            json!({
                "probe_uuid": probe_uuid,
                "url": target.url,
                "cluster_uuid": target.cluster_uuid,
                "type": target.kind,
            })
        })
        .collect();
    Json(json!({"entities": entities}))
}

async fn entity_registration(
    State(state): State<AppState>,
    Json(request): Json<RegisterProbeRequest>,
) -> Result<Response, AppError> {
    state.registry.lock().unwrap().insert(
        request.probe_uuid.clone(),
        ProbeTarget {
            url: request.url.clone(),
            kind: request.kind,
            cluster_uuid: request.cluster_uuid.clone(),
        },
    );
    state.emit(TelemetryEvent::Registration(request)).await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

async fn get_entity(
    State(state): State<AppState>,
    Path(entity_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let entity_uuid = entity_uuid.to_string();
    let target = state
        .lookup(&entity_uuid)
        .ok_or_else(|| AppError::NotFoundError(entity_uuid.clone()))?;
    Ok(Json(json!({
        "probe_uuid": entity_uuid,
        "url": target.url,
        "cluster_uuid": target.cluster_uuid,
        "type": target.kind,
    }))
    .into_response())
}

async fn put_entity(
    State(state): State<AppState>,
    Path(entity_uuid): Path<Uuid>,
    Json(mut request): Json<RegisterProbeRequest>,
) -> Result<Response, AppError> {
    request.probe_uuid = entity_uuid.to_string();
    state.registry.lock().unwrap().insert(
        request.probe_uuid.clone(),
        ProbeTarget {
            url: request.url.clone(),
            kind: request.kind,
            cluster_uuid: request.cluster_uuid.clone(),
        },
    );
    state.emit(TelemetryEvent::Registration(request)).await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
}

async fn delete_entity(
    State(state): State<AppState>,
    Path(entity_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let entity_uuid = entity_uuid.to_string();
    state.registry.lock().unwrap().remove(&entity_uuid);
    state
        .emit(TelemetryEvent::Deregistration {
            probe_uuid: entity_uuid,
        })
        .await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

// ============================================
// PULL-THROUGH INVENTORY / MONITOR
// ============================================

async fn inventory_entity(
    State(state): State<AppState>,
    Path(entity_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let entity_uuid = entity_uuid.to_string();
    let Some(target) = state.lookup(&entity_uuid) else {
        return Err(AppError::NotFoundError(entity_uuid));
    };

    let response = state
        .http
        .get(format!("{}/api/v1/telemetry/probe/inventory", target.url))
        .basic_auth(&state.agent_uuid, Some(""))
        .timeout(state.query_timeout())
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            match response.json::<Value>().await {
                Ok(payload) => {
                    state
                        .emit(TelemetryEvent::Inventory {
                            probe: ProbeDescriptor {
                                probe_uuid: entity_uuid,
                                kind: target.kind,
                                cluster_uuid: target.cluster_uuid,
                            },
                            data: payload.clone(),
                        })
                        .await?;
                    Ok((StatusCode::OK, Json(payload)).into_response())
                }
                Err(err) => {
                    error!("Unable to request inventory data from entity '{entity_uuid}': {err}");
                    Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response())
                }
            }
        }
        Ok(response) => {
            Ok((forwarded_status(response.status()), Json(json!({}))).into_response())
        }
        Err(err) => {
            error!("Unable to request inventory data from entity '{entity_uuid}': {err}");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response())
        }
    }
}

async fn monitor_entity(
    State(state): State<AppState>,
    Path(entity_uuid): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let entity_uuid = entity_uuid.to_string();
    let Some(target) = state.lookup(&entity_uuid) else {
        return Err(AppError::NotFoundError(entity_uuid));
    };

    let mut request = state
        .http
        .get(format!("{}/api/v1/telemetry/probe/monitor", target.url))
        .basic_auth(&state.agent_uuid, Some(""))
        .timeout(state.query_timeout());
    if let Some(monitor_target) = params.get("target") {
        request = request.query(&[("target", monitor_target)]);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<Value>().await {
                Ok(payload) => {
                    match serde_json::from_value::<MonitorEnvelope>(payload.clone()) {
                        Ok(envelope) => {
                            state
                                .emit(TelemetryEvent::Monitor {
                                    cluster_uuid: target.cluster_uuid,
                                    envelope,
                                })
                                .await?;
                        }
                        Err(err) => {
                            warn!("Monitoring payload of '{entity_uuid}' is not a typed envelope: {err}")
                        }
                    }
                    Ok((StatusCode::OK, Json(payload)).into_response())
                }
                Err(err) => {
                    error!("Unable to request monitoring data from entity '{entity_uuid}': {err}");
                    Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response())
                }
            }
        }
        Ok(response) => {
            Ok((forwarded_status(response.status()), Json(json!({}))).into_response())
        }
        Err(err) => {
            error!("Unable to request monitoring data from entity '{entity_uuid}': {err}");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response())
        }
    }
}

// ============================================
// DEPLOYMENT OVERLAY
// ============================================

async fn post_deployment(
    State(state): State<AppState>,
    Json(request): Json<AgentDeploymentsRequest>,
) -> Result<Response, AppError> {
    state
        .emit(TelemetryEvent::Deployment(DeploymentEvent::Post {
            deployment_uuid: request.deployment_uuid,
            k8s_deployments: request.k8s_deployments,
        }))
        .await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
}

async fn delete_deployment(
    State(state): State<AppState>,
    Path(deployment_uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    state
        .emit(TelemetryEvent::Deployment(DeploymentEvent::Delete {
            deployment_uuid: deployment_uuid.to_string(),
        }))
        .await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
}

/// The per-deployment read-through never had a resolvable entity in the
/// original contract; the endpoint is kept but unimplemented.
async fn get_deployment(Path(_deployment_uuid): Path<Uuid>) -> Result<Response, AppError> {
    Err(AppError::NotImplementedError)
}

async fn post_deployment_specific_metrics(
    State(state): State<AppState>,
    Json(metrics): Json<DeploymentSpecificMetrics>,
) -> Result<Response, AppError> {
    state
        .emit(TelemetryEvent::DeploymentSpecificMetrics(metrics))
        .await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
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
) -> Result<Response, AppError> {
    state.emit(TelemetryEvent::Configuration(update)).await?;
    Ok((StatusCode::CREATED, Json(json!({}))).into_response())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/telemetry/agent",
            get(get_configuration).put(put_configuration),
        )
        .route("/api/v1/telemetry/agent/entities", get(get_registered_entities))
        .route("/api/v1/telemetry/agent/register", post(entity_registration))
        .route(
            "/api/v1/telemetry/agent/register/{entity_uuid}",
            get(get_entity).put(put_entity).delete(delete_entity),
        )
        .route(
            "/api/v1/telemetry/agent/inventory/{entity_uuid}",
            get(inventory_entity),
        )
        .route(
            "/api/v1/telemetry/agent/monitor/{entity_uuid}",
            get(monitor_entity),
        )
        .route("/api/v1/telemetry/agent/deployments", post(post_deployment))
        .route(
            "/api/v1/telemetry/agent/deployments/{deployment_uuid}",
            get(get_deployment).delete(delete_deployment),
        )
        .route(
            "/api/v1/telemetry/agent/deployment_specific_metrics",
            post(post_deployment_specific_metrics),
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
    use httpmock::prelude::*;
    use shared::models::ProbeKind;
    use tower::ServiceExt;

    const AUTH: &str = "Basic c2VycmFubzo="; // "serrano:"

    fn test_state() -> (AppState, mpsc::Receiver<TelemetryEvent>) {
        let (events, receiver) = mpsc::channel(16);
        let state = AppState {
            agent_uuid: "5be8ad61-0a21-4b93-8342-a6fc8e4f06c3".to_owned(),
            events,
            registry: Arc::new(Mutex::new(HashMap::new())),
            options: Arc::new(Mutex::new(RuntimeOptions {
                query_interval: 60,
                query_timeout: 5,
                active_monitoring: true,
            })),
            rest_interface: RestInterfaceConfig {
                address: "0.0.0.0".to_owned(),
                port: 8100,
                exposed_service: None,
            },
            http: reqwest::Client::new(),
        };
        (state, receiver)
    }

    fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request.header(header::AUTHORIZATION, AUTH)
    }

    #[tokio::test]
    async fn requests_without_credentials_are_rejected() {
        let (state, _events) = test_state();
        let response = app(state)
            .oneshot(
                HttpRequest::get("/api/v1/telemetry/agent/entities")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registration_updates_the_registry_and_emits_an_event() {
        let (state, mut events) = test_state();
        let registry = state.registry.clone();

        let body = json!({
            "probe_uuid": "aa8512f2-7c6c-4a4e-a8c4-c27b7c1a3f2b",
            "url": "https://probe:8300",
            "cluster_uuid": "c4c5b2f1-91f9-4e9f-9a5f-3c2b1a4d5e6f",
            "type": "Probe.k8s"
        });
        let response = app(state)
            .oneshot(
                authed(HttpRequest::post("/api/v1/telemetry/agent/register"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(
            registry
                .lock()
                .unwrap()
                .contains_key("aa8512f2-7c6c-4a4e-a8c4-c27b7c1a3f2b")
        );
        match events.recv().await.unwrap() {
            TelemetryEvent::Registration(request) => {
                assert_eq!(request.kind, ProbeKind::K8s);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_entities_answer_404() {
        let (state, _events) = test_state();
        let response = app(state)
            .oneshot(
                authed(HttpRequest::get(
                    "/api/v1/telemetry/agent/monitor/0a651c5e-6a7c-4c0b-b9a8-07a20ff8a1f3",
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn monitor_pull_through_emits_a_typed_event() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/telemetry/probe/monitor");
                then.status(200).json_body(json!({
                    "uuid": "aa8512f2-7c6c-4a4e-a8c4-c27b7c1a3f2b",
                    "type": "Probe.HPC",
                    "hpc_monitoring_data": {"name": "site", "partitions": []}
                }));
            })
            .await;

        let (state, mut events) = test_state();
        state.registry.lock().unwrap().insert(
            "aa8512f2-7c6c-4a4e-a8c4-c27b7c1a3f2b".to_owned(),
            ProbeTarget {
                url: server.base_url(),
                kind: ProbeKind::Hpc,
                cluster_uuid: "c-1".to_owned(),
            },
        );

        let response = app(state)
            .oneshot(
                authed(HttpRequest::get(
                    "/api/v1/telemetry/agent/monitor/aa8512f2-7c6c-4a4e-a8c4-c27b7c1a3f2b",
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        match events.recv().await.unwrap() {
            TelemetryEvent::Monitor {
                cluster_uuid,
                envelope,
            } => {
                assert_eq!(cluster_uuid, "c-1");
                assert_eq!(envelope.kind(), ProbeKind::Hpc);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn deployment_endpoints_emit_overlay_events() {
        let (state, mut events) = test_state();
        let app = app(state);

        let response = app
            .clone()
            .oneshot(
                authed(HttpRequest::post("/api/v1/telemetry/agent/deployments"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "deployment_uuid": "d-1",
                            "k8s_deployments": [{"app": "demo"}]
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        match events.recv().await.unwrap() {
            TelemetryEvent::Deployment(DeploymentEvent::Post {
                deployment_uuid, ..
            }) => assert_eq!(deployment_uuid, "d-1"),
            other => panic!("unexpected event {other:?}"),
        }

        let response = app
            .oneshot(
                authed(HttpRequest::delete(
                    "/api/v1/telemetry/agent/deployments/e9f8a7b6-c5d4-4e3f-8a9b-0c1d2e3f4a5b",
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        match events.recv().await.unwrap() {
            TelemetryEvent::Deployment(DeploymentEvent::Delete { deployment_uuid }) => {
                assert_eq!(deployment_uuid, "e9f8a7b6-c5d4-4e3f-8a9b-0c1d2e3f4a5b")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_per_deployment_read_is_unimplemented() {
        let (state, _events) = test_state();
        let response = app(state)
            .oneshot(
                authed(HttpRequest::get(
                    "/api/v1/telemetry/agent/deployments/e9f8a7b6-c5d4-4e3f-8a9b-0c1d2e3f4a5b",
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
