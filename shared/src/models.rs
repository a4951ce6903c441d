use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity type tag stored for telemetry agents in the operational store.
pub const ENTITY_TYPE_AGENT: &str = "Agent";

/// The three probe flavours of the platform. The wire representation keeps
/// the historical `Probe.*` strings so that registrations from older probes
/// keep deserializing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ProbeKind {
    #[serde(rename = "Probe.k8s", alias = "Probe.K8s")]
    K8s,
    #[serde(rename = "Probe.HPC")]
    Hpc,
    #[serde(rename = "Probe.EdgeStorage")]
    EdgeStorage,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::K8s => "Probe.k8s",
            ProbeKind::Hpc => "Probe.HPC",
            ProbeKind::EdgeStorage => "Probe.EdgeStorage",
        }
    }

    /// Cluster record type for cluster-scoped probes, `None` for edge storage.
    pub fn cluster_type(&self) -> Option<&'static str> {
        match self {
            ProbeKind::K8s => Some("k8s"),
            ProbeKind::Hpc => Some("HPC"),
            ProbeKind::EdgeStorage => None,
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        !matches!(self, ProbeKind::EdgeStorage)
    }

    /// Parse the `type` string of a stored entity document.
    pub fn from_entity_type(value: &str) -> Option<ProbeKind> {
        if value.contains("Probe.k8s") || value.contains("Probe.K8s") {
            Some(ProbeKind::K8s)
        } else if value == "Probe.HPC" {
            Some(ProbeKind::Hpc)
        } else if value == "Probe.EdgeStorage" {
            Some(ProbeKind::EdgeStorage)
        } else {
            None
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum LivenessStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

/// Liveness/state event published to the notification bus.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NotificationEvent {
    pub entity_id: String,
    pub status: LivenessStatus,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub timestamp: i64,
}

impl NotificationEvent {
    pub fn probe_up(probe_uuid: &str) -> Self {
        Self {
            entity_id: probe_uuid.to_owned(),
            status: LivenessStatus::Up,
            entity_type: "Probe".to_owned(),
            timestamp: unix_now(),
        }
    }

    pub fn probe_down(probe_uuid: &str) -> Self {
        Self {
            entity_id: probe_uuid.to_owned(),
            status: LivenessStatus::Down,
            entity_type: "Probe".to_owned(),
            timestamp: unix_now(),
        }
    }
}

/// A registered probe as held in the in-memory registry of an agent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProbeTarget {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    pub cluster_uuid: String,
}

/// Mutable runtime options of an agent or the central handler.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RuntimeOptions {
    pub query_interval: u64,
    pub query_timeout: u64,
    pub active_monitoring: bool,
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_kind_keeps_wire_strings() {
        let kind: ProbeKind = serde_json::from_str("\"Probe.k8s\"").unwrap();
        assert_eq!(kind, ProbeKind::K8s);
        let kind: ProbeKind = serde_json::from_str("\"Probe.K8s\"").unwrap();
        assert_eq!(kind, ProbeKind::K8s);
        assert_eq!(
            serde_json::to_string(&ProbeKind::EdgeStorage).unwrap(),
            "\"Probe.EdgeStorage\""
        );
    }

    #[test]
    fn entity_type_parsing_matches_cluster_typing_rules() {
        assert_eq!(ProbeKind::from_entity_type("Probe.k8s"), Some(ProbeKind::K8s));
        assert_eq!(ProbeKind::from_entity_type("Probe.K8s"), Some(ProbeKind::K8s));
        assert_eq!(ProbeKind::from_entity_type("Probe.HPC"), Some(ProbeKind::Hpc));
        assert_eq!(ProbeKind::from_entity_type("Agent"), None);
        assert_eq!(ProbeKind::K8s.cluster_type(), Some("k8s"));
        assert_eq!(ProbeKind::Hpc.cluster_type(), Some("HPC"));
        assert_eq!(ProbeKind::EdgeStorage.cluster_type(), None);
    }

    #[test]
    fn notification_event_serializes_status_and_type_tags() {
        let event = NotificationEvent::probe_down("p-1");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "DOWN");
        assert_eq!(value["type"], "Probe");
        assert_eq!(value["entity_id"], "p-1");
    }
}
