use std::collections::HashMap;
use std::sync::Mutex;

use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc, to_bson, to_document};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use shared::models::{ENTITY_TYPE_AGENT, ProbeKind, unix_now};
use shared::schemas::{
    DeploymentPodMetric, DeploymentSpecificMetrics, EdgeDeviceInventory, MonitorEnvelope,
    PodSample, ProbeDescriptor, RegisterProbeRequest,
};
use shared::services::mongo::Mongo;
use shared::utilities::errors::AppError;

use crate::controller::DeploymentEvent;
use crate::pmds_writer::PmdsSample;

/// Writes probe samples into the operational store and fans them out to the
/// time-series writer. Owns the deployment-monitoring overlay.
pub struct DataEngine {
    agent_uuid: String,
    agent_url: String,
    retain_period: i64,

    clusters: mongodb::Collection<Document>,
    entities: mongodb::Collection<Document>,
    cluster_metrics: mongodb::Collection<Document>,
    edge_storage: mongodb::Collection<Document>,
    edge_storage_metrics: mongodb::Collection<Document>,
    deployments: mongodb::Collection<Document>,
    deployments_specific_metrics: mongodb::Collection<Document>,
    cluster_deployment_metrics: mongodb::Collection<Document>,

    /// deployment_uuid -> pod-label selectors of this agent's clusters
    overlay: Mutex<HashMap<String, Vec<Value>>>,
    pmds: mpsc::Sender<PmdsSample>,
}

/// Keep the pods whose `serrano_deployment_uuid` is a tracked deployment,
/// re-keyed for the `cluster_deployment_metrics` collection.
pub(crate) fn project_deployment_pods(
    overlay: &HashMap<String, Vec<Value>>,
    cluster_uuid: &str,
    timestamp: i64,
    pods: &[PodSample],
) -> Vec<DeploymentPodMetric> {
    pods.iter()
        .filter(|pod| overlay.contains_key(&pod.serrano_deployment_uuid))
        .map(|pod| DeploymentPodMetric::from_pod(pod, cluster_uuid, timestamp))
        .collect()
}

impl DataEngine {
    pub async fn new(
        mongo: &Mongo,
        agent_uuid: &str,
        agent_url: &str,
        retain_period: i64,
        pmds: mpsc::Sender<PmdsSample>,
    ) -> Result<Self, AppError> {
        let engine = Self {
            agent_uuid: agent_uuid.to_owned(),
            agent_url: agent_url.to_owned(),
            retain_period,
            clusters: mongo.collection("clusters"),
            entities: mongo.collection("entities"),
            cluster_metrics: mongo.collection("cluster_state_metrics"),
            edge_storage: mongo.collection("edge_storage"),
            edge_storage_metrics: mongo.collection("edge_storage_metrics"),
            deployments: mongo.collection("serrano_deployments"),
            deployments_specific_metrics: mongo.collection("deployments_specific_metrics"),
            cluster_deployment_metrics: mongo.collection("cluster_deployment_metrics"),
            overlay: Mutex::new(HashMap::new()),
            pmds,
        };

        engine.initialize_agent_entity().await?;
        if let Err(err) = engine.load_deployments_monitoring().await {
            error!("Unable to load existing deployment descriptions: {err}");
        }

        Ok(engine)
    }

    async fn initialize_agent_entity(&self) -> Result<(), AppError> {
        if self
            .entities
            .count_documents(doc! {"uuid": &self.agent_uuid})
            .await?
            == 0
        {
            self.entities
                .insert_one(doc! {
                    "uuid": &self.agent_uuid,
                    "type": ENTITY_TYPE_AGENT,
                    "url": &self.agent_url,
                    "probes": [],
                    "timestamp": unix_now(),
                })
                .await?;
        } else {
            self.entities
                .update_one(
                    doc! {"uuid": &self.agent_uuid},
                    doc! {"$set": {"url": &self.agent_url, "timestamp": unix_now()}},
                )
                .await?;
        }
        Ok(())
    }

    /// Rebuild the overlay from the deployments tracked for this agent's
    /// k8s clusters, reading the `per_cluster` keyed sub-documents.
    async fn load_deployments_monitoring(&self) -> Result<(), AppError> {
        info!("Load existing deployment descriptions for monitoring ...");

        let probe_uuids = self.agent_probe_uuids().await?;
        let mut cursor = self
            .entities
            .find(doc! {"type": "Probe.k8s", "uuid": {"$in": &probe_uuids}})
            .projection(doc! {"_id": 0, "cluster_uuid": 1})
            .await?;

        let mut loaded: HashMap<String, Vec<Value>> = HashMap::new();
        while let Some(cluster) = cursor.try_next().await? {
            let Ok(cluster_uuid) = cluster.get_str("cluster_uuid") else {
                continue;
            };
            let mut deployments = self
                .deployments
                .find(doc! {"clusters": {"$in": [cluster_uuid]}})
                .await?;
            while let Some(deployment) = deployments.try_next().await? {
                let Ok(deployment_uuid) = deployment.get_str("deployment_uuid") else {
                    continue;
                };
                let selectors = deployment
                    .get_document("per_cluster")
                    .ok()
                    .and_then(|per_cluster| per_cluster.get_array(cluster_uuid).ok())
                    .map(|selectors| {
                        selectors.iter().cloned().map(Value::from).collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                loaded.insert(deployment_uuid.to_owned(), selectors);
            }
        }

        debug!("Deployments under monitoring: {:?}", loaded.keys());
        *self.overlay.lock().unwrap() = loaded;
        Ok(())
    }

    async fn agent_probe_uuids(&self) -> Result<Vec<String>, AppError> {
        let agent = self
            .entities
            .find_one(doc! {"uuid": &self.agent_uuid})
            .await?;
        Ok(agent
            .and_then(|entity| entity.get_array("probes").ok().cloned())
            .map(|probes| {
                probes
                    .iter()
                    .filter_map(|probe| probe.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The probe entities owned by this agent, used to rebuild the poll set
    /// at boot.
    pub async fn agent_probes(&self) -> Result<Vec<Document>, AppError> {
        let ids = self.agent_probe_uuids().await?;
        let cursor = self.entities.find(doc! {"uuid": {"$in": ids}}).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn handle_probe_registration(
        &self,
        request: &RegisterProbeRequest,
    ) -> Result<(), AppError> {
        info!(
            "Update operational database with registered probe '{}'",
            request.probe_uuid
        );

        if self
            .entities
            .count_documents(doc! {"uuid": &request.probe_uuid})
            .await?
            == 0
        {
            self.entities
                .insert_one(doc! {
                    "uuid": &request.probe_uuid,
                    "type": request.kind.as_str(),
                    "url": &request.url,
                    "cluster_uuid": &request.cluster_uuid,
                    "timestamp": unix_now(),
                })
                .await?;
        } else {
            self.entities
                .update_one(
                    doc! {"uuid": &request.probe_uuid},
                    doc! {"$set": {
                        "url": &request.url,
                        "type": request.kind.as_str(),
                        "cluster_uuid": &request.cluster_uuid,
                        "timestamp": unix_now(),
                    }},
                )
                .await?;
        }

        if self
            .entities
            .count_documents(
                doc! {"uuid": &self.agent_uuid, "probes": {"$in": [&request.probe_uuid]}},
            )
            .await?
            == 0
        {
            self.entities
                .update_one(
                    doc! {"uuid": &self.agent_uuid},
                    doc! {"$push": {"probes": &request.probe_uuid}},
                )
                .await?;
        }

        match request.kind {
            ProbeKind::EdgeStorage => {
                if let Some(inventory) = &request.inventory {
                    self.set_edge_storage_inventory(inventory).await?;
                }
            }
            _ => {
                self.set_cluster_inventory(
                    &request.cluster_uuid,
                    request.kind,
                    request.inventory.as_ref(),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Per-device upsert keyed by `(name, cluster_uuid)`.
    async fn set_edge_storage_inventory(&self, inventory: &Value) -> Result<(), AppError> {
        let devices: Vec<EdgeDeviceInventory> = serde_json::from_value(
            inventory
                .get("edge_storage_devices")
                .cloned()
                .unwrap_or(Value::Array(Vec::new())),
        )?;

        for device in devices {
            let filter = doc! {"name": &device.name, "cluster_uuid": &device.cluster_uuid};
            if self.edge_storage.count_documents(filter.clone()).await? == 0 {
                let mut document = to_document(&device)?;
                document.insert("timestamp", unix_now());
                self.edge_storage.insert_one(document).await?;
            } else {
                self.edge_storage
                    .update_one(
                        filter,
                        doc! {"$set": {
                            "timestamp": unix_now(),
                            "lat": device.lat,
                            "lng": device.lng,
                            "minio_node_disk_total_bytes": device.minio_node_disk_total_bytes,
                        }},
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Upsert the cluster record; k8s inventories live under the probe's
    /// `kubernetes_inventory_data` field, HPC inventories are stored whole.
    async fn set_cluster_inventory(
        &self,
        cluster_uuid: &str,
        kind: ProbeKind,
        inventory: Option<&Value>,
    ) -> Result<(), AppError> {
        let cluster_type = kind.cluster_type().unwrap_or("k8s");
        let inventory_value = inventory.map(|value| match kind {
            ProbeKind::K8s => value
                .get("kubernetes_inventory_data")
                .cloned()
                .unwrap_or(Value::Null),
            _ => value.clone(),
        });

        if self
            .clusters
            .count_documents(doc! {"uuid": cluster_uuid})
            .await?
            == 0
        {
            let mut cluster = doc! {
                "uuid": cluster_uuid,
                "type": cluster_type,
                "name": "",
                "timestamp": unix_now(),
            };
            if let Some(value) = &inventory_value {
                cluster.insert("inventory", to_bson(value)?);
            }
            self.clusters.insert_one(cluster).await?;
        } else {
            let mut update = doc! {"timestamp": unix_now()};
            if let Some(value) = &inventory_value {
                update.insert("inventory", to_bson(value)?);
            }
            self.clusters
                .update_one(doc! {"uuid": cluster_uuid}, doc! {"$set": update})
                .await?;
        }
        Ok(())
    }

    /// Cascade delete: cluster or edge rows and their metrics, then the
    /// probe's membership in the agent entity, then the probe entity.
    pub async fn handle_probe_deregistration(&self, probe_uuid: &str) -> Result<(), AppError> {
        info!("Remove deregistered probe '{probe_uuid}' from operational database");

        let Some(entity) = self.entities.find_one(doc! {"uuid": probe_uuid}).await? else {
            return Ok(());
        };
        let cluster_uuid = entity.get_str("cluster_uuid").unwrap_or_default().to_owned();
        let kind = ProbeKind::from_entity_type(entity.get_str("type").unwrap_or_default());

        match kind {
            Some(ProbeKind::EdgeStorage) => {
                self.edge_storage
                    .delete_many(doc! {"cluster_uuid": &cluster_uuid})
                    .await?;
                self.edge_storage_metrics
                    .delete_many(doc! {"cluster_uuid": &cluster_uuid})
                    .await?;
            }
            _ => {
                self.clusters.delete_one(doc! {"uuid": &cluster_uuid}).await?;
                self.cluster_metrics
                    .delete_many(doc! {"cluster_uuid": &cluster_uuid})
                    .await?;
            }
        }

        self.entities
            .update_one(
                doc! {"uuid": &self.agent_uuid},
                doc! {"$pull": {"probes": probe_uuid}},
            )
            .await?;
        self.entities.delete_one(doc! {"uuid": probe_uuid}).await?;
        Ok(())
    }

    pub async fn handle_inventory(
        &self,
        probe: &ProbeDescriptor,
        data: &Value,
    ) -> Result<(), AppError> {
        info!(
            "Update operational database with inventory data from probe '{}'",
            probe.probe_uuid
        );
        match probe.kind {
            ProbeKind::EdgeStorage => self.set_edge_storage_inventory(data).await,
            _ => {
                self.set_cluster_inventory(&probe.cluster_uuid, probe.kind, Some(data))
                    .await
            }
        }
    }

    /// Monitoring write path: retention purge, operational-store insert,
    /// overlay projection for k8s pods, then the time-series fan-out. A
    /// failed store write is logged and dropped; the next poll retries.
    pub async fn handle_monitor(&self, cluster_uuid: &str, envelope: MonitorEnvelope) {
        info!(
            "Update operational database with monitoring data from probe '{}'",
            envelope.probe_uuid()
        );
        let now = unix_now();
        let probe_uuid = envelope.probe_uuid().to_owned();

        let sample = match envelope {
            MonitorEnvelope::EdgeStorage {
                edge_storage_devices,
                ..
            } => {
                if let Err(err) = self
                    .write_edge_storage_metrics(cluster_uuid, &edge_storage_devices, now)
                    .await
                {
                    error!("Unable to update operational database: {err}");
                }
                PmdsSample::EdgeStorage {
                    probe_uuid,
                    cluster_uuid: cluster_uuid.to_owned(),
                    data: edge_storage_devices,
                }
            }
            MonitorEnvelope::K8s {
                kubernetes_monitoring_data,
                ..
            } => {
                if let Some(pods) = &kubernetes_monitoring_data.pods {
                    let matched = {
                        let overlay = self.overlay.lock().unwrap();
                        project_deployment_pods(&overlay, cluster_uuid, now, pods)
                    };
                    if !matched.is_empty() {
                        debug!("Handle deployment metrics ...");
                        if let Err(err) =
                            self.write_cluster_deployment_metrics(cluster_uuid, &matched, now).await
                        {
                            error!("Unable to update operational database: {err}");
                        }
                        self.forward(PmdsSample::DeploymentMonitoring { data: matched })
                            .await;
                    }
                }

                if let Err(err) = self
                    .write_cluster_state(cluster_uuid, &kubernetes_monitoring_data, now)
                    .await
                {
                    error!("Unable to update operational database: {err}");
                }
                PmdsSample::K8s {
                    probe_uuid,
                    cluster_uuid: cluster_uuid.to_owned(),
                    data: kubernetes_monitoring_data,
                }
            }
            MonitorEnvelope::Hpc {
                hpc_monitoring_data,
                ..
            } => {
                if let Err(err) = self
                    .write_cluster_state(cluster_uuid, &hpc_monitoring_data, now)
                    .await
                {
                    error!("Unable to update operational database: {err}");
                }
                PmdsSample::Hpc {
                    probe_uuid,
                    cluster_uuid: cluster_uuid.to_owned(),
                    data: hpc_monitoring_data,
                }
            }
        };

        self.forward(sample).await;
    }

    async fn forward(&self, sample: PmdsSample) {
        if self.pmds.send(sample).await.is_err() {
            error!("Time-series writer channel closed, sample dropped");
        }
    }

    async fn write_edge_storage_metrics(
        &self,
        cluster_uuid: &str,
        devices: &[shared::schemas::EdgeDeviceMetrics],
        now: i64,
    ) -> Result<(), AppError> {
        self.edge_storage_metrics
            .delete_many(doc! {
                "cluster_uuid": cluster_uuid,
                "timestamp": {"$lte": now - self.retain_period},
            })
            .await?;
        for device in devices {
            let mut document = to_document(device)?;
            document.insert("timestamp", now);
            self.edge_storage_metrics.insert_one(document).await?;
        }
        Ok(())
    }

    async fn write_cluster_deployment_metrics(
        &self,
        cluster_uuid: &str,
        matched: &[DeploymentPodMetric],
        now: i64,
    ) -> Result<(), AppError> {
        self.cluster_deployment_metrics
            .delete_many(doc! {
                "cluster_uuid": cluster_uuid,
                "timestamp": {"$lte": now - self.retain_period},
            })
            .await?;
        let documents: Vec<Document> = matched
            .iter()
            .map(to_document)
            .collect::<Result<_, _>>()?;
        self.cluster_deployment_metrics.insert_many(documents).await?;
        Ok(())
    }

    async fn write_cluster_state<T: serde::Serialize>(
        &self,
        cluster_uuid: &str,
        state: &T,
        now: i64,
    ) -> Result<(), AppError> {
        self.cluster_metrics
            .delete_many(doc! {
                "cluster_uuid": cluster_uuid,
                "timestamp": {"$lte": now - self.retain_period},
            })
            .await?;
        self.cluster_metrics
            .insert_one(doc! {
                "cluster_uuid": cluster_uuid,
                "timestamp": now,
                "state": Bson::Document(to_document(state)?),
            })
            .await?;
        Ok(())
    }

    /// Overlay mutation from deployment events, linearizable with the
    /// pod-projection reads.
    pub async fn handle_deployment_event(&self, event: DeploymentEvent) {
        info!("Update list of application deployments for monitoring");
        let mut overlay = self.overlay.lock().unwrap();
        match event {
            DeploymentEvent::Post {
                deployment_uuid,
                k8s_deployments,
            } => {
                overlay.insert(deployment_uuid, k8s_deployments);
            }
            DeploymentEvent::Delete { deployment_uuid } => {
                overlay.remove(&deployment_uuid);
            }
        }
    }

    pub async fn handle_deployment_specific_metrics(
        &self,
        metrics: DeploymentSpecificMetrics,
    ) -> Result<(), AppError> {
        let now = unix_now();
        self.deployments_specific_metrics
            .delete_many(doc! {
                "deployment_uuid": &metrics.deployment_uuid,
                "timestamp": {"$lte": now - self.retain_period},
            })
            .await?;

        let mut document = to_document(&metrics)?;
        if metrics.timestamp.is_none() {
            document.insert("timestamp", now);
        }
        self.deployments_specific_metrics.insert_one(document).await?;

        self.forward(PmdsSample::DeploymentSpecificMetrics { data: metrics })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, deployment_uuid: &str) -> PodSample {
        PodSample {
            name: name.to_owned(),
            namespace: "default".to_owned(),
            serrano_deployment_uuid: deployment_uuid.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn projection_keeps_only_tracked_deployments() {
        let mut overlay = HashMap::new();
        overlay.insert("d-1".to_owned(), vec![serde_json::json!({"app": "demo"})]);

        let pods = vec![pod("pod-a", "d-1"), pod("pod-b", ""), pod("pod-c", "d-2")];
        let matched = project_deployment_pods(&overlay, "c-1", 1_700_000_000, &pods);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "pod-a");
        assert_eq!(matched[0].deployment_uuid, "d-1");
        assert_eq!(matched[0].cluster_uuid, "c-1");
        assert_eq!(matched[0].timestamp, 1_700_000_000);
    }

    #[test]
    fn projection_of_untracked_cluster_is_empty() {
        let overlay = HashMap::new();
        let pods = vec![pod("pod-a", "d-1")];
        assert!(project_deployment_pods(&overlay, "c-1", 0, &pods).is_empty());
    }
}
