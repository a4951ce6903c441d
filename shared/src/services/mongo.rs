use mongodb::{Client, Database, bson::Document};
use tracing::info;

use crate::utilities::{config::OperationalDbConfig, errors::AppError};

/// Handle onto the operational document store.
#[derive(Clone)]
pub struct Mongo {
    pub client: Client,
    pub db: Database,
}

impl Mongo {
    pub async fn new(config: &OperationalDbConfig) -> Result<Self, AppError> {
        let client = Client::with_uri_str(config.uri()).await?;
        let db = client.database(&config.db_name);
        info!("✅ Operational store client ready for '{}'", config.db_name);
        Ok(Self { client, db })
    }

    pub fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }
}
