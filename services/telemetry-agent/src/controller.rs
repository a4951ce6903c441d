use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use shared::models::NotificationEvent;
use shared::schemas::{
    DeploymentSpecificMetrics, MonitorEnvelope, ProbeDescriptor, RegisterProbeRequest,
    RuntimeOptionsUpdate,
};
use shared::services::kafka::Notifier;

use crate::collector::Collector;
use crate::data_engine::DataEngine;

#[derive(Clone, Debug)]
pub enum DeploymentEvent {
    Post {
        deployment_uuid: String,
        k8s_deployments: Vec<Value>,
    },
    Delete {
        deployment_uuid: String,
    },
}

/// Typed event stream from the access interface into the agent internals.
/// One variant per accepted action; anything else is rejected at ingress.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    Registration(RegisterProbeRequest),
    Deregistration { probe_uuid: String },
    Inventory { probe: ProbeDescriptor, data: Value },
    Monitor { cluster_uuid: String, envelope: MonitorEnvelope },
    Deployment(DeploymentEvent),
    DeploymentSpecificMetrics(DeploymentSpecificMetrics),
    Configuration(RuntimeOptionsUpdate),
}

/// Single-writer dispatcher: drains the event channel and forwards each
/// event to exactly one downstream consumer. Registration additionally
/// raises an UP notification, deregistration the symmetric DOWN.
pub async fn run(
    mut events: mpsc::Receiver<TelemetryEvent>,
    collector: Arc<Collector>,
    engine: Arc<DataEngine>,
    notifier: Arc<Notifier>,
) {
    info!("Telemetry controller is running ...");

    while let Some(event) = events.recv().await {
        debug!("Handle access interface event: {event:?}");

        match event {
            TelemetryEvent::Registration(request) => {
                if let Err(err) = notifier
                    .publish(&NotificationEvent::probe_up(&request.probe_uuid))
                    .await
                {
                    error!("Unable to publish UP notification: {err}");
                }
                collector.register(&request).await;
            }
            TelemetryEvent::Deregistration { probe_uuid } => {
                if let Err(err) = notifier
                    .publish(&NotificationEvent::probe_down(&probe_uuid))
                    .await
                {
                    error!("Unable to publish DOWN notification: {err}");
                }
                collector.deregister(&probe_uuid).await;
            }
            TelemetryEvent::Inventory { probe, data } => {
                if let Err(err) = engine.handle_inventory(&probe, &data).await {
                    error!(
                        "Unable to store inventory data of probe '{}': {err}",
                        probe.probe_uuid
                    );
                }
            }
            TelemetryEvent::Monitor {
                cluster_uuid,
                envelope,
            } => {
                engine.handle_monitor(&cluster_uuid, envelope).await;
            }
            TelemetryEvent::Deployment(event) => {
                engine.handle_deployment_event(event).await;
            }
            TelemetryEvent::DeploymentSpecificMetrics(metrics) => {
                if let Err(err) = engine.handle_deployment_specific_metrics(metrics).await {
                    error!("Unable to store deployment specific metrics: {err}");
                }
            }
            TelemetryEvent::Configuration(update) => {
                collector.apply_configuration(&update);
            }
        }
    }
}
