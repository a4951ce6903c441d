use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use shared::models::ProbeKind;
use shared::utilities::config::ProbeConfig;
use shared::utilities::errors::AppError;

use crate::probes::edge_storage::EdgeStorageProbe;
use crate::probes::hpc::HpcProbe;
use crate::probes::kubernetes::K8sProbe;

/// Query parameters of the probe surface. `target` belongs to the k8s
/// backend, `device_name`/`detect_devices` to edge storage.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProbeQuery {
    pub target: Option<String>,
    pub device_name: Option<String>,
    pub detect_devices: Option<String>,
}

impl ProbeQuery {
    fn detect_devices(&self) -> bool {
        self.detect_devices
            .as_deref()
            .map(|raw| !raw.is_empty())
            .unwrap_or(false)
    }
}

/// The scraping backend behind the uniform probe contract, selected by the
/// configuration's `type` tag.
pub enum Backend {
    K8s(K8sProbe),
    Hpc(HpcProbe),
    EdgeStorage(EdgeStorageProbe),
}

impl Backend {
    pub async fn init(config: &ProbeConfig) -> Result<Self, AppError> {
        match config.kind {
            ProbeKind::K8s => {
                let k8s = config.k8s.as_ref().ok_or_else(|| {
                    AppError::ConfigError("missing 'k8s' section for Probe.k8s".to_owned())
                })?;
                Ok(Backend::K8s(
                    K8sProbe::new(&config.probe_uuid, k8s, config.query_timeout).await?,
                ))
            }
            ProbeKind::Hpc => {
                let hpc = config.hpc.as_ref().ok_or_else(|| {
                    AppError::ConfigError("missing 'hpc' section for Probe.HPC".to_owned())
                })?;
                Ok(Backend::Hpc(HpcProbe::new(
                    &config.probe_uuid,
                    hpc,
                    config.query_timeout,
                )?))
            }
            ProbeKind::EdgeStorage => {
                let k8s = config.k8s.as_ref().ok_or_else(|| {
                    AppError::ConfigError("missing 'k8s' section for Probe.EdgeStorage".to_owned())
                })?;
                let edge = config.edge_storage.as_ref().ok_or_else(|| {
                    AppError::ConfigError(
                        "missing 'edge_storage' section for Probe.EdgeStorage".to_owned(),
                    )
                })?;
                Ok(Backend::EdgeStorage(
                    EdgeStorageProbe::new(
                        &config.probe_uuid,
                        &config.cluster_uuid,
                        k8s,
                        edge,
                        config.query_timeout,
                    )
                    .await?,
                ))
            }
        }
    }

    pub fn kind(&self) -> ProbeKind {
        match self {
            Backend::K8s(_) => ProbeKind::K8s,
            Backend::Hpc(_) => ProbeKind::Hpc,
            Backend::EdgeStorage(_) => ProbeKind::EdgeStorage,
        }
    }

    /// Full static description of the scraped backend. Failures have
    /// already been logged by the backend; the response is an empty typed
    /// record, never an error across the HTTP boundary.
    pub async fn inventory(&self, query: &ProbeQuery) -> Value {
        let inventory = match self {
            Backend::K8s(probe) => serde_json::to_value(probe.inventory().await),
            Backend::Hpc(probe) => serde_json::to_value(probe.inventory().await),
            Backend::EdgeStorage(probe) => serde_json::to_value(
                probe
                    .inventory(query.device_name.as_deref(), query.detect_devices())
                    .await,
            ),
        };
        inventory.unwrap_or_else(|err| {
            error!("Unable to serialize inventory payload: {err}");
            json!({})
        })
    }

    pub async fn monitor(&self, query: &ProbeQuery) -> Value {
        let envelope = match self {
            Backend::K8s(probe) => probe.monitoring(query.target.as_deref()).await,
            Backend::Hpc(probe) => probe.monitoring().await,
            Backend::EdgeStorage(probe) => {
                probe
                    .monitoring(query.device_name.as_deref(), query.detect_devices())
                    .await
            }
        };
        serde_json::to_value(&envelope).unwrap_or_else(|err| {
            error!("Unable to serialize monitoring envelope: {err}");
            json!({})
        })
    }
}
