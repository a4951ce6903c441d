use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tracing::{debug, info};

use crate::utilities::errors::AppError;

pub const NOTIFICATION_TOPIC: &str = "serrano_telemetry_notifications";

/// Producer onto the platform notification topic. Values are JSON, the
/// producer compresses with gzip, and every publish is awaited so callers
/// observe delivery failures.
#[derive(Clone)]
pub struct Notifier {
    producer: FutureProducer,
    topic: String,
}

impl Notifier {
    pub fn new(bootstrap_servers: &str) -> Result<Self, AppError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .set("compression.type", "gzip")
            .create::<FutureProducer>()?;

        info!("✅ Notification producer created.");

        Ok(Self {
            producer,
            topic: NOTIFICATION_TOPIC.to_owned(),
        })
    }

    pub async fn publish<T: Serialize>(&self, event: &T) -> Result<(), AppError> {
        let payload = serde_json::to_string(event)?;
        debug!("Forward telemetry notification event: {payload}");

        self.producer
            .send(
                FutureRecord::<(), String>::to(&self.topic).payload(&payload),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(err, _)| AppError::from(err))?;

        Ok(())
    }
}
