use std::collections::HashMap;

use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc, to_document};
use serde_json::{Value, json};
use tracing::{error, info};

use shared::models::{ENTITY_TYPE_AGENT, unix_now};
use shared::schemas::{AgentDeploymentsRequest, DeploymentDoc, KernelDeploymentUpdate};
use shared::services::mongo::Mongo;
use shared::utilities::errors::AppError;

/// Route to the agent owning a cluster, derived from the entity mirror.
#[derive(Clone, Debug)]
pub struct AgentRoute {
    pub url: String,
    pub probe_uuid: String,
}

/// Decide whether a kernel-deployment counter update may be applied. A
/// negative diff against a zero (or absent) counter of an existing record
/// is silently ignored so counters never go negative.
pub(crate) fn kernel_counter_allows(current: Option<i64>, counter_diff: i64) -> bool {
    if counter_diff >= 0 {
        return true;
    }
    !matches!(current, Some(0))
}

/// Gateway-provided edge ids are keyed by `(cluster, region)`; a device
/// resolves through `(cluster_uuid, name)`, `-1` when unknown.
pub(crate) fn resolve_edge_id(
    ids: &HashMap<(String, String), i64>,
    cluster_uuid: &str,
    name: &str,
) -> i64 {
    ids.get(&(cluster_uuid.to_owned(), name.to_owned()))
        .copied()
        .unwrap_or(-1)
}

/// The per-cluster fan-out of a deployment POST: each listed cluster gets
/// exactly its own selector subset.
pub(crate) fn per_cluster_requests(
    deployment: &DeploymentDoc,
) -> Vec<(String, AgentDeploymentsRequest)> {
    deployment
        .clusters
        .iter()
        .map(|cluster_uuid| {
            (
                cluster_uuid.clone(),
                AgentDeploymentsRequest {
                    deployment_uuid: deployment.deployment_uuid.clone(),
                    k8s_deployments: deployment
                        .per_cluster
                        .get(cluster_uuid)
                        .cloned()
                        .unwrap_or_default(),
                },
            )
        })
        .collect()
}

fn bson_as_i64(value: &Bson) -> i64 {
    match value {
        Bson::Int32(v) => *v as i64,
        Bson::Int64(v) => *v,
        Bson::Double(v) => *v as i64,
        _ => 0,
    }
}

fn documents_to_values(documents: Vec<Document>) -> Vec<Value> {
    documents
        .into_iter()
        .map(|document| Bson::Document(document).into())
        .collect()
}

/// CTH-side mirror over the cross-agent operational view plus the
/// CTH-owned deployment, kernel and metric collections.
pub struct CentralEngine {
    handler_uuid: String,
    clusters: mongodb::Collection<Document>,
    kernels: mongodb::Collection<Document>,
    kernel_deployments: mongodb::Collection<Document>,
    kernel_metrics: mongodb::Collection<Document>,
    entities: mongodb::Collection<Document>,
    cluster_metrics: mongodb::Collection<Document>,
    cloud_storage: mongodb::Collection<Document>,
    edge_storage: mongodb::Collection<Document>,
    deployments: mongodb::Collection<Document>,
    deployments_specific_metrics: mongodb::Collection<Document>,
    cluster_deployment_metrics: mongodb::Collection<Document>,
}

impl CentralEngine {
    pub fn new(mongo: &Mongo, handler_uuid: &str) -> Self {
        Self {
            handler_uuid: handler_uuid.to_owned(),
            clusters: mongo.collection("clusters"),
            kernels: mongo.collection("serrano_kernels"),
            kernel_deployments: mongo.collection("serrano_kernel_deployments"),
            kernel_metrics: mongo.collection("serrano_kernel_metrics"),
            entities: mongo.collection("entities"),
            cluster_metrics: mongo.collection("cluster_state_metrics"),
            cloud_storage: mongo.collection("cloud_storage_locations"),
            edge_storage: mongo.collection("edge_storage"),
            deployments: mongo.collection("serrano_deployments"),
            deployments_specific_metrics: mongo.collection("deployments_specific_metrics"),
            cluster_deployment_metrics: mongo.collection("cluster_deployment_metrics"),
        }
    }

    /// Truncate-and-rewrite of the mirrored cloud storage locations.
    pub async fn handle_cloud_storage_locations(
        &self,
        locations: Vec<Document>,
    ) -> Result<(), AppError> {
        info!("Update operational database with cloud storage locations");
        self.cloud_storage.delete_many(doc! {}).await?;
        if !locations.is_empty() {
            self.cloud_storage.insert_many(locations).await?;
        }
        Ok(())
    }

    /// cluster_uuid -> owning agent, derived by walking every Agent entity
    /// and joining each of its probes to that probe's cluster.
    pub async fn get_registered_agents(&self) -> Result<HashMap<String, AgentRoute>, AppError> {
        let mut agents_by_cluster = HashMap::new();

        let mut agents = self
            .entities
            .find(doc! {"type": ENTITY_TYPE_AGENT})
            .projection(doc! {"url": 1, "probes": 1})
            .await?;
        while let Some(agent) = agents.try_next().await? {
            let url = agent.get_str("url").unwrap_or_default().to_owned();
            let probes = agent.get_array("probes").ok().cloned().unwrap_or_default();
            for probe_id in probes.iter().filter_map(Bson::as_str) {
                let probe = self
                    .entities
                    .find_one(doc! {"uuid": probe_id})
                    .projection(doc! {"cluster_uuid": 1})
                    .await?;
                if let Some(cluster_uuid) =
                    probe.as_ref().and_then(|p| p.get_str("cluster_uuid").ok())
                {
                    agents_by_cluster.insert(
                        cluster_uuid.to_owned(),
                        AgentRoute {
                            url: url.clone(),
                            probe_uuid: probe_id.to_owned(),
                        },
                    );
                }
            }
        }

        Ok(agents_by_cluster)
    }

    pub async fn get_infrastructure(&self, kernels: Option<&str>) -> Result<Value, AppError> {
        let k8s = self
            .clusters
            .find(doc! {"type": "k8s"})
            .projection(doc! {
                "_id": 0,
                "uuid": 1,
                "inventory.node_info.architecture": 1,
                "inventory.node_capacity.total_fpga": 1,
                "inventory.node_capacity.total_gpu": 1,
                "inventory.node_capacity.cpu": 1,
                "inventory.node_capacity.memory": 1,
                "inventory.node_labels": 1,
            })
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        let hpc = self
            .clusters
            .find(doc! {"type": "HPC"})
            .projection(doc! {"_id": 0, "uuid": 1, "inventory.partitions": 1})
            .await?
            .try_collect::<Vec<_>>()
            .await?;

        let mut data = json!({
            "k8s": documents_to_values(k8s),
            "hpc": documents_to_values(hpc),
        });

        if let Some(query_kernels) = kernels {
            let mut filter = doc! {};
            let query_kernels = if query_kernels.is_empty() {
                "FaaS"
            } else {
                query_kernels
            };
            if query_kernels.eq_ignore_ascii_case("faas") {
                filter.insert("deployment_mode", "FaaS");
            }
            if query_kernels.eq_ignore_ascii_case("standalone") {
                filter.insert("deployment_mode", "Standalone");
            }
            let kernels = self
                .kernels
                .find(filter)
                .projection(doc! {"_id": 0})
                .await?
                .try_collect::<Vec<_>>()
                .await?;
            data["kernels"] = Value::Array(documents_to_values(kernels));
        }

        Ok(data)
    }

    /// Capacity/security projection of one cluster's inventory.
    pub async fn get_infrastructure_inventory(&self, uuid: &str) -> Result<Value, AppError> {
        let capacity = self
            .clusters
            .find(doc! {"uuid": uuid})
            .projection(doc! {
                "_id": 0,
                "inventory.node_name": 1,
                "inventory.node_capacity.total_fpga": 1,
                "inventory.node_capacity.total_gpu": 1,
                "inventory.node_capacity.cpu": 1,
                "inventory.node_capacity.memory": 1,
            })
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        let security = self
            .clusters
            .find(doc! {"uuid": uuid})
            .projection(doc! {
                "_id": 0,
                "inventory.node_name": 1,
                "inventory.node_labels.vaccel": 1,
                "inventory.node_labels.security-tier": 1,
            })
            .await?
            .try_collect::<Vec<_>>()
            .await?;

        Ok(json!({
            "capacity": documents_to_values(capacity),
            "security": documents_to_values(security),
        }))
    }

    pub async fn get_serrano_deployments(
        &self,
        deployment_uuid: Option<&str>,
    ) -> Result<Vec<Value>, AppError> {
        let documents = match deployment_uuid {
            Some(uuid) => {
                self.deployments
                    .find(doc! {"deployment_uuid": uuid})
                    .projection(doc! {"_id": 0})
                    .await?
                    .try_collect::<Vec<_>>()
                    .await?
            }
            None => {
                self.deployments
                    .find(doc! {})
                    .projection(doc! {"_id": 0, "deployment_uuid": 1, "clusters": 1, "timestamp": 1})
                    .await?
                    .try_collect::<Vec<_>>()
                    .await?
            }
        };
        Ok(documents_to_values(documents))
    }

    /// Per-cluster union of every tracked deployment's selector list.
    pub async fn get_per_cluster_deployments(&self) -> Result<Value, AppError> {
        let mut data: HashMap<String, Vec<Value>> = HashMap::new();

        let mut cursor = self
            .deployments
            .find(doc! {})
            .projection(doc! {"_id": 0})
            .await?;
        while let Some(document) = cursor.try_next().await? {
            let Ok(deployment) =
                mongodb::bson::from_document::<DeploymentDoc>(document)
            else {
                continue;
            };
            for cluster_uuid in &deployment.clusters {
                let selectors = deployment
                    .per_cluster
                    .get(cluster_uuid)
                    .cloned()
                    .unwrap_or_default();
                data.entry(cluster_uuid.clone()).or_default().extend(selectors);
            }
        }

        Ok(serde_json::to_value(data)?)
    }

    /// Store a deployment (delete-then-insert by `deployment_uuid`) and fan
    /// the per-cluster selector subsets out to each owning agent.
    pub async fn set_serrano_deployment(
        &self,
        http: &reqwest::Client,
        mut deployment: DeploymentDoc,
    ) -> Result<(), AppError> {
        for (cluster_uuid, request) in per_cluster_requests(&deployment) {
            match self.resolve_agent(&cluster_uuid).await {
                Ok(Some((agent_uuid, agent_url))) => {
                    info!(
                        "Request application monitoring from Agent '{agent_uuid}' @ '{agent_url}'"
                    );
                    let result = http
                        .post(format!("{agent_url}/api/v1/telemetry/agent/deployments"))
                        .basic_auth(&self.handler_uuid, Some(""))
                        .json(&request)
                        .send()
                        .await;
                    match result {
                        Ok(response)
                            if !matches!(response.status().as_u16(), 200 | 201) =>
                        {
                            error!(
                                "Unable to forward application monitoring request to Agent '{agent_uuid}'"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => error!("{err}"),
                    }
                }
                Ok(None) => {
                    error!("No agent registered for cluster '{cluster_uuid}'");
                }
                Err(err) => error!("{err}"),
            }
        }

        if deployment.timestamp == 0 {
            deployment.timestamp = unix_now();
        }
        if self
            .deployments
            .count_documents(doc! {"deployment_uuid": &deployment.deployment_uuid})
            .await?
            > 0
        {
            self.deployments
                .delete_one(doc! {"deployment_uuid": &deployment.deployment_uuid})
                .await?;
        }
        self.deployments.insert_one(to_document(&deployment)?).await?;
        Ok(())
    }

    pub async fn delete_serrano_deployment(
        &self,
        http: &reqwest::Client,
        deployment_uuid: &str,
    ) -> Result<(), AppError> {
        let Some(document) = self
            .deployments
            .find_one(doc! {"deployment_uuid": deployment_uuid})
            .await?
        else {
            return Ok(());
        };
        let deployment: DeploymentDoc = mongodb::bson::from_document(document)?;

        for cluster_uuid in &deployment.clusters {
            match self.resolve_agent(cluster_uuid).await {
                Ok(Some((agent_uuid, agent_url))) => {
                    info!("Terminate application monitoring from Agent '{agent_uuid}'");
                    let result = http
                        .delete(format!(
                            "{agent_url}/api/v1/telemetry/agent/deployments/{deployment_uuid}"
                        ))
                        .basic_auth(&self.handler_uuid, Some(""))
                        .send()
                        .await;
                    match result {
                        Ok(response)
                            if !matches!(response.status().as_u16(), 200 | 201) =>
                        {
                            error!(
                                "Unable to forward termination request for application monitoring to Agent '{agent_uuid}'"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => error!("{err}"),
                    }
                }
                Ok(None) => error!("No agent registered for cluster '{cluster_uuid}'"),
                Err(err) => error!("{err}"),
            }
        }

        self.deployments
            .delete_one(doc! {"deployment_uuid": deployment_uuid})
            .await?;
        Ok(())
    }

    /// `(agent_uuid, agent_url)` of the agent owning the cluster's k8s probe.
    async fn resolve_agent(
        &self,
        cluster_uuid: &str,
    ) -> Result<Option<(String, String)>, AppError> {
        let Some(probe) = self
            .entities
            .find_one(doc! {"type": "Probe.k8s", "cluster_uuid": cluster_uuid})
            .projection(doc! {"uuid": 1})
            .await?
        else {
            return Ok(None);
        };
        let Ok(probe_uuid) = probe.get_str("uuid") else {
            return Ok(None);
        };
        let Some(agent) = self
            .entities
            .find_one(doc! {"type": ENTITY_TYPE_AGENT, "probes": probe_uuid})
            .await?
        else {
            return Ok(None);
        };
        Ok(Some((
            agent.get_str("uuid").unwrap_or_default().to_owned(),
            agent.get_str("url").unwrap_or_default().to_owned(),
        )))
    }

    pub async fn get_clusters(&self) -> Result<Vec<Value>, AppError> {
        let documents = self
            .clusters
            .find(doc! {})
            .projection(doc! {"_id": 0, "uuid": 1, "type": 1, "name": 1})
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(documents_to_values(documents))
    }

    pub async fn get_cluster(&self, cluster_uuid: &str) -> Result<Option<Value>, AppError> {
        Ok(self
            .clusters
            .find_one(doc! {"uuid": cluster_uuid})
            .projection(doc! {"_id": 0})
            .await?
            .map(|document| Bson::Document(document).into()))
    }

    /// Operational-store history: full series for `target=all`, otherwise
    /// the latest sample, newest first either way.
    pub async fn get_cluster_metrics(
        &self,
        cluster_uuid: &str,
        target: Option<&str>,
    ) -> Result<Vec<Value>, AppError> {
        let find = self
            .cluster_metrics
            .find(doc! {"cluster_uuid": cluster_uuid})
            .projection(doc! {"_id": 0})
            .sort(doc! {"timestamp": -1});
        let documents = if target == Some("all") {
            find.await?.try_collect::<Vec<_>>().await?
        } else {
            find.limit(1).await?.try_collect::<Vec<_>>().await?
        };
        Ok(documents_to_values(documents))
    }

    /// Storage location report: edge devices joined with their newest
    /// metrics row and decorated with gateway ids, plus the mirrored cloud
    /// locations.
    pub async fn get_storage_locations(
        &self,
        http: &reqwest::Client,
        gateway_address: &str,
        target: Option<&str>,
    ) -> Result<Value, AppError> {
        let mut data = json!({});

        let mut edge_ids: HashMap<(String, String), i64> = HashMap::new();
        match http
            .get(format!("http://{gateway_address}/edge_locations"))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                if let Ok(entries) = response.json::<Vec<Value>>().await {
                    for entry in entries {
                        let (Some(cluster), Some(region), Some(id)) = (
                            entry.get("cluster").and_then(Value::as_str),
                            entry.get("region").and_then(Value::as_str),
                            entry.get("id").and_then(Value::as_i64),
                        ) else {
                            continue;
                        };
                        edge_ids.insert((cluster.to_owned(), region.to_owned()), id);
                    }
                }
            }
            Ok(response) => error!("Edge gateway returned {}", response.status()),
            Err(err) => error!("{err}"),
        }

        if target.is_none() || target == Some("edge") {
            let pipeline = vec![
                doc! {"$project": {"_id": 0, "timestamp": 0}},
                doc! {"$lookup": {
                    "from": "edge_storage_metrics",
                    "localField": "name",
                    "foreignField": "name",
                    "as": "metrics",
                    "pipeline": [
                        {"$project": {
                            "_id": 0,
                            "minio_node_disk_total_bytes": 1,
                            "minio_node_disk_used_bytes": 1,
                            "minio_node_disk_free_bytes": 1,
                        }},
                        {"$sort": {"timestamp": -1}},
                        {"$limit": 1},
                    ],
                }},
            ];
            let devices = self
                .edge_storage
                .aggregate(pipeline)
                .await?
                .try_collect::<Vec<_>>()
                .await?;

            let decorated: Vec<Value> = documents_to_values(devices)
                .into_iter()
                .map(|mut device| {
                    let id = resolve_edge_id(
                        &edge_ids,
                        device.get("cluster_uuid").and_then(Value::as_str).unwrap_or(""),
                        device.get("name").and_then(Value::as_str).unwrap_or(""),
                    );
                    device["id"] = json!(id);
                    device
                })
                .collect();
            data["edge_storage"] = Value::Array(decorated);
        }

        if target.is_none() || target == Some("cloud") {
            let documents = self
                .cloud_storage
                .find(doc! {})
                .projection(doc! {"_id": 0})
                .await?
                .try_collect::<Vec<_>>()
                .await?;
            data["cloud_storage"] = Value::Array(documents_to_values(documents));
        }

        Ok(data)
    }

    pub async fn get_kernel_deployments(
        &self,
        deployment_mode: Option<&str>,
    ) -> Result<Value, AppError> {
        let filter = match deployment_mode {
            Some(mode) => doc! {"deployment_mode": mode},
            None => doc! {},
        };
        let documents = self
            .kernel_deployments
            .find(filter)
            .projection(doc! {"_id": 0})
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(json!({"kernel_deployments": documents_to_values(documents)}))
    }

    pub async fn update_kernel_deployments(
        &self,
        update: &KernelDeploymentUpdate,
    ) -> Result<(), AppError> {
        if update.counter_diff < 0 {
            let current = self
                .kernel_deployments
                .find_one(doc! {
                    "cluster_uuid": &update.cluster_uuid,
                    "deployment_mode": &update.deployment_mode,
                })
                .await?
                .map(|record| record.get(&update.kernel_mode).map(bson_as_i64).unwrap_or(0));
            if !kernel_counter_allows(current, update.counter_diff) {
                return Ok(());
            }
        }

        self.kernel_deployments
            .update_one(
                doc! {
                    "deployment_mode": &update.deployment_mode,
                    "cluster_uuid": &update.cluster_uuid,
                },
                doc! {"$inc": {update.kernel_mode.as_str(): update.counter_diff}},
            )
            .await?;
        Ok(())
    }

    pub async fn add_kernel_metrics(&self, logs: Vec<Value>) -> Result<(), AppError> {
        let documents: Vec<Document> = logs
            .iter()
            .filter_map(|log| to_document(log).ok())
            .collect();
        if !documents.is_empty() {
            self.kernel_metrics.insert_many(documents).await?;
        }
        Ok(())
    }

    pub async fn get_kernel_metrics(
        &self,
        filters: &HashMap<String, String>,
    ) -> Result<Value, AppError> {
        let mut query = doc! {};
        if let Some(request_uuid) = filters.get("request_uuid") {
            query.insert("uuid", request_uuid);
        }
        for key in ["cluster_uuid", "kernel_name", "kernel_mode"] {
            if let Some(value) = filters.get(key) {
                query.insert(key, value);
            }
        }
        let documents = self
            .kernel_metrics
            .find(query)
            .projection(doc! {"_id": 0})
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(json!({"metrics": documents_to_values(documents)}))
    }

    pub async fn get_deployment_specific_metrics(
        &self,
        deployment_uuid: &str,
        filters: &HashMap<String, String>,
    ) -> Result<Value, AppError> {
        let mut query = doc! {"deployment_uuid": deployment_uuid};
        for key in ["cluster_uuid", "service_id"] {
            if let Some(value) = filters.get(key) {
                query.insert(key, value);
            }
        }
        let documents = self
            .deployments_specific_metrics
            .find(query)
            .projection(doc! {"_id": 0, "deployment_uuid": 0})
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(json!({"specific_metrics": documents_to_values(documents)}))
    }

    pub async fn get_deployment_metrics(
        &self,
        deployment_uuid: &str,
    ) -> Result<Vec<Value>, AppError> {
        let documents = self
            .cluster_deployment_metrics
            .find(doc! {"deployment_uuid": deployment_uuid})
            .projection(doc! {"_id": 0})
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(documents_to_values(documents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_diffs_against_a_zero_counter_are_ignored() {
        // S5: kernel counter at 0 stays at 0
        assert!(!kernel_counter_allows(Some(0), -1));
        // counter at 2 may be decremented
        assert!(kernel_counter_allows(Some(2), -1));
        // no record yet: the $inc matches nothing, allowing it is harmless
        assert!(kernel_counter_allows(None, -1));
        // increments always pass
        assert!(kernel_counter_allows(Some(0), 1));
    }

    #[test]
    fn fan_out_carries_only_each_clusters_selector_subset() {
        let mut per_cluster = std::collections::BTreeMap::new();
        per_cluster.insert("c-1".to_owned(), vec![json!({"app": "a"})]);
        per_cluster.insert("c-2".to_owned(), vec![json!({"app": "b"}), json!({"app": "c"})]);

        let deployment = DeploymentDoc {
            deployment_uuid: "d-1".to_owned(),
            clusters: vec!["c-1".to_owned(), "c-2".to_owned()],
            per_cluster,
            timestamp: 0,
        };

        let requests = per_cluster_requests(&deployment);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "c-1");
        assert_eq!(requests[0].1.k8s_deployments, vec![json!({"app": "a"})]);
        assert_eq!(requests[1].0, "c-2");
        assert_eq!(requests[1].1.k8s_deployments.len(), 2);
        assert_eq!(requests[1].1.deployment_uuid, "d-1");
    }

    #[test]
    fn edge_ids_resolve_by_cluster_and_name() {
        let mut ids = HashMap::new();
        ids.insert(("c-1".to_owned(), "minio-0".to_owned()), 7);
        assert_eq!(resolve_edge_id(&ids, "c-1", "minio-0"), 7);
        assert_eq!(resolve_edge_id(&ids, "c-1", "minio-1"), -1);
        assert_eq!(resolve_edge_id(&ids, "c-2", "minio-0"), -1);
    }
}
