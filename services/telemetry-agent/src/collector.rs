use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info};

use shared::models::{NotificationEvent, ProbeTarget, RuntimeOptions};
use shared::schemas::{MonitorEnvelope, RegisterProbeRequest, RuntimeOptionsUpdate};
use shared::services::kafka::Notifier;

use crate::data_engine::DataEngine;

/// Record a failed monitor call; `true` when the probe was newly flagged
/// and a DOWN notification is due.
pub(crate) fn note_failure(flagged: &mut HashSet<String>, probe_uuid: &str) -> bool {
    flagged.insert(probe_uuid.to_owned())
}

/// A successful monitor call clears the flag, re-arming the next DOWN.
pub(crate) fn note_success(flagged: &mut HashSet<String>, probe_uuid: &str) -> bool {
    flagged.remove(probe_uuid)
}

/// Periodic acquisition of monitoring data from every registered probe.
/// The poll set is owned here and mutated by the dispatcher, while the
/// access interface keeps its own registry for pull-through lookups; a
/// probe only enters the poll set after its registration has been written,
/// so its inventory write precedes its first monitor write.
pub struct Collector {
    agent_uuid: String,
    registry: Arc<Mutex<HashMap<String, ProbeTarget>>>,
    poll_set: Mutex<HashMap<String, ProbeTarget>>,
    flagged: Mutex<HashSet<String>>,
    options: Arc<Mutex<RuntimeOptions>>,
    engine: Arc<DataEngine>,
    notifier: Arc<Notifier>,
    http: reqwest::Client,
}

impl Collector {
    pub fn new(
        agent_uuid: &str,
        registry: Arc<Mutex<HashMap<String, ProbeTarget>>>,
        options: Arc<Mutex<RuntimeOptions>>,
        engine: Arc<DataEngine>,
        notifier: Arc<Notifier>,
    ) -> Result<Self, shared::utilities::errors::AppError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            agent_uuid: agent_uuid.to_owned(),
            registry,
            poll_set: Mutex::new(HashMap::new()),
            flagged: Mutex::new(HashSet::new()),
            options,
            engine,
            notifier,
            http,
        })
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.options.lock().unwrap().query_timeout.max(1))
    }

    /// Load this agent's probes from the operational store and keep the
    /// ones that answer a ping within the query timeout.
    pub async fn boot_load_probes(&self) {
        let probes = match self.engine.agent_probes().await {
            Ok(probes) => probes,
            Err(err) => {
                error!("Unable to load probes from operational database: {err}");
                return;
            }
        };

        for probe in probes {
            let (Ok(uuid), Ok(url), Ok(entity_type), Ok(cluster_uuid)) = (
                probe.get_str("uuid"),
                probe.get_str("url"),
                probe.get_str("type"),
                probe.get_str("cluster_uuid"),
            ) else {
                continue;
            };
            let Some(kind) = shared::models::ProbeKind::from_entity_type(entity_type) else {
                continue;
            };

            let alive = self
                .http
                .get(format!("{url}/api/v1/telemetry/probe/ping"))
                .basic_auth(&self.agent_uuid, Some(""))
                .timeout(self.query_timeout())
                .send()
                .await
                .map(|response| response.status().is_success())
                .unwrap_or(false);

            if alive {
                let target = ProbeTarget {
                    url: url.to_owned(),
                    kind,
                    cluster_uuid: cluster_uuid.to_owned(),
                };
                self.registry
                    .lock()
                    .unwrap()
                    .insert(uuid.to_owned(), target.clone());
                self.poll_set.lock().unwrap().insert(uuid.to_owned(), target);
            } else {
                error!("Failed to query probe '{uuid}'");
            }
        }

        info!(
            "Boot loaded {} probes into the poll set",
            self.poll_set.lock().unwrap().len()
        );
    }

    pub async fn register(&self, request: &RegisterProbeRequest) {
        if let Err(err) = self.engine.handle_probe_registration(request).await {
            error!("Failed to register probe: {err}");
        }

        self.poll_set.lock().unwrap().insert(
            request.probe_uuid.clone(),
            ProbeTarget {
                url: request.url.clone(),
                kind: request.kind,
                cluster_uuid: request.cluster_uuid.clone(),
            },
        );
        note_success(&mut self.flagged.lock().unwrap(), &request.probe_uuid);
    }

    pub async fn deregister(&self, probe_uuid: &str) {
        let known = self.poll_set.lock().unwrap().remove(probe_uuid).is_some();
        if !known {
            return;
        }
        if let Err(err) = self.engine.handle_probe_deregistration(probe_uuid).await {
            error!("Failed to deregister probe: {err}");
        }
    }

    pub fn apply_configuration(&self, update: &RuntimeOptionsUpdate) {
        let mut options = self.options.lock().unwrap();
        update.apply(&mut options);
        info!(
            "Runtime options changed: interval {}s, timeout {}s, active {}",
            options.query_interval, options.query_timeout, options.active_monitoring
        );
    }

    /// Timer task driving the acquisition loop at `query_interval` seconds.
    pub async fn run(self: Arc<Self>) {
        loop {
            let (interval, active) = {
                let options = self.options.lock().unwrap();
                (options.query_interval, options.active_monitoring)
            };
            tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
            if !active {
                continue;
            }
            self.acquire_monitoring_data().await;
        }
    }

    async fn acquire_monitoring_data(&self) {
        let probes: Vec<(String, ProbeTarget)> = {
            let poll_set = self.poll_set.lock().unwrap();
            poll_set
                .iter()
                .map(|(uuid, target)| (uuid.clone(), target.clone()))
                .collect()
        };

        for (probe_uuid, target) in probes {
            info!("Retrieve monitoring data from probe '{probe_uuid}'");
            match self.fetch_monitor(&target).await {
                Ok(envelope) => {
                    note_success(&mut self.flagged.lock().unwrap(), &probe_uuid);
                    self.engine
                        .handle_monitor(&target.cluster_uuid, envelope)
                        .await;
                }
                Err(err) => {
                    error!("Unable to retrieve monitoring data from probe '{probe_uuid}': {err}");
                    let newly_flagged =
                        note_failure(&mut self.flagged.lock().unwrap(), &probe_uuid);
                    if newly_flagged {
                        if let Err(err) = self
                            .notifier
                            .publish(&NotificationEvent::probe_down(&probe_uuid))
                            .await
                        {
                            error!("Unable to publish DOWN notification: {err}");
                        }
                    }
                }
            }
        }
    }

    async fn fetch_monitor(
        &self,
        target: &ProbeTarget,
    ) -> Result<MonitorEnvelope, shared::utilities::errors::AppError> {
        let response = self
            .http
            .get(format!("{}/api/v1/telemetry/probe/monitor", target.url))
            .basic_auth(&self.agent_uuid, Some(""))
            .timeout(self.query_timeout())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(shared::utilities::errors::AppError::UpstreamStatus(
                response.status().as_u16(),
            ));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_probe_emits_one_down_until_cleared() {
        let mut flagged = HashSet::new();

        // first failure notifies, the second does not
        assert!(note_failure(&mut flagged, "p-1"));
        assert!(!note_failure(&mut flagged, "p-1"));

        // success re-arms the flag
        assert!(note_success(&mut flagged, "p-1"));
        assert!(note_failure(&mut flagged, "p-1"));
    }

    #[test]
    fn distinct_probes_are_flagged_independently() {
        let mut flagged = HashSet::new();
        assert!(note_failure(&mut flagged, "p-1"));
        assert!(note_failure(&mut flagged, "p-2"));
        assert!(!note_failure(&mut flagged, "p-1"));
    }
}
