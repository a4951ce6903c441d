use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use shared::utilities::auth::decode_basic;
use shared::utilities::errors::AppError;

use crate::backend::{Backend, ProbeQuery};

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    /// Credentials from `probe_interface`; `None` disables the auth guard.
    pub credentials: Option<(String, String)>,
    pub collection_config: Arc<Mutex<Value>>,
}

/// Basic-auth guard of the probe surface: when credentials are configured
/// the caller must present exactly those, otherwise requests pass freely.
async fn probe_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some((username, password)) = &state.credentials else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic);

    match presented {
        Some((user, pass)) if user == *username && pass == *password => next.run(request).await,
        _ => AppError::UnauthorizedError.into_response(),
    }
}

async fn ping() -> impl IntoResponse {
    Json(json!({}))
}

async fn inventory(
    State(state): State<AppState>,
    Query(query): Query<ProbeQuery>,
) -> impl IntoResponse {
    Json(state.backend.inventory(&query).await)
}

async fn monitor(
    State(state): State<AppState>,
    Query(query): Query<ProbeQuery>,
) -> impl IntoResponse {
    Json(state.backend.monitor(&query).await)
}

async fn configure_collection(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    *state.collection_config.lock().await = body;
    Json(json!({}))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/telemetry/probe/ping", get(ping))
        .route("/api/v1/telemetry/probe/inventory", get(inventory))
        .route("/api/v1/telemetry/probe/monitor", get(monitor))
        .route("/api/v1/telemetry/probe/collection", post(configure_collection))
        .layer(middleware::from_fn_with_state(state.clone(), probe_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode, header};
    use shared::utilities::config::HpcGatewayConfig;
    use tower::ServiceExt;

    use crate::probes::hpc::HpcProbe;

    fn test_state(credentials: Option<(String, String)>) -> AppState {
        let probe = HpcProbe::new(
            "0b6f54d3-9d3c-41ec-90cf-4eb47d2a5c7e",
            &HpcGatewayConfig {
                address: "http://127.0.0.1:1".to_owned(),
                infrastructure: "hpc-site".to_owned(),
            },
            1,
        )
        .unwrap();
        AppState {
            backend: Arc::new(Backend::Hpc(probe)),
            credentials,
            collection_config: Arc::new(Mutex::new(Value::Null)),
        }
    }

    #[tokio::test]
    async fn ping_answers_empty_object() {
        let app = app(test_state(None));
        let response = app
            .oneshot(
                HttpRequest::get("/api/v1/telemetry/probe/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn configured_credentials_are_enforced() {
        let state = test_state(Some(("probe".to_owned(), "secret".to_owned())));
        let app = app(state);

        let denied = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/v1/telemetry/probe/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        // "probe:secret"
        let allowed = app
            .oneshot(
                HttpRequest::get("/api/v1/telemetry/probe/ping")
                    .header(header::AUTHORIZATION, "Basic cHJvYmU6c2VjcmV0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn monitor_returns_a_typed_envelope_even_when_the_backend_fails() {
        let app = app(test_state(None));
        let response = app
            .oneshot(
                HttpRequest::get("/api/v1/telemetry/probe/monitor")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "Probe.HPC");
        assert!(value["hpc_monitoring_data"]["partitions"].as_array().unwrap().is_empty());
    }
}
