use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, ServerApi, ServerApiVersion, UpdateOptions},
    Client, Collection, Database,
};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::migration::store::{InsertOutcome, SourceRow, SourceStore, TargetRecord, TargetStore};

const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct DatabaseManager {
    pub client: Client,
    pub database: Database,
}

impl DatabaseManager {
    pub async fn new(mongodb_uri: &str, database_name: &str) -> Result<Self> {
        info!("🔄 Connecting to MongoDB...");

        let mut client_options = ClientOptions::parse(mongodb_uri)
            .await
            .map_err(|e| AppError::ConfigError(format!("Failed to parse MongoDB URI: {}", e)))?;

        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options).map_err(|e| {
            AppError::ConfigError(format!("Failed to create MongoDB client: {}", e))
        })?;

        let manager = DatabaseManager {
            database: client.database(database_name),
            client,
        };
        manager.ping().await?;

        info!(database = database_name, "✅ Successfully connected to MongoDB!");
        Ok(manager)
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(|e| AppError::SourceStoreError(format!("Failed to ping MongoDB: {}", e)))?;
        Ok(())
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }
}

/// Reads legacy collections. ObjectId keys are rendered as hex strings so
/// they can serve as primary keys.
pub struct MongoSourceStore {
    db: DatabaseManager,
}

impl MongoSourceStore {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SourceStore for MongoSourceStore {
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>> {
        let cursor = self
            .db
            .collection(table)
            .find(None, None)
            .await
            .map_err(|e| AppError::SourceStoreError(format!("Failed to query {}: {}", table, e)))?;
        let documents: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| AppError::SourceStoreError(format!("Failed to read {}: {}", table, e)))?;

        debug!(table = table, documents = documents.len(), "Read source collection");

        Ok(documents.into_iter().filter_map(document_to_row).collect())
    }
}

fn document_to_row(mut document: Document) -> Option<SourceRow> {
    if let Some(Bson::ObjectId(oid)) = document.get("_id") {
        let hex = oid.to_hex();
        document.insert("_id", Bson::String(hex));
    }
    match Bson::Document(document).into_relaxed_extjson() {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Target collections keyed by `_id = migrationId`.
pub struct MongoTargetStore {
    db: DatabaseManager,
}

impl MongoTargetStore {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TargetStore for MongoTargetStore {
    async fn find_by_migration_id(&self, table: &str, migration_id: &str) -> Result<Option<TargetRecord>> {
        let found = self
            .db
            .collection(table)
            .find_one(doc! {"_id": migration_id}, None)
            .await?;

        found
            .map(|document| {
                bson::from_document::<TargetRecord>(document).map_err(|e| {
                    AppError::TargetStoreError(format!("Stored record {} is unreadable: {}", migration_id, e))
                })
            })
            .transpose()
    }

    async fn insert_if_absent(&self, record: TargetRecord) -> Result<InsertOutcome> {
        let document = bson::to_document(&record)
            .map_err(|e| AppError::TargetStoreError(format!("Failed to encode record: {}", e)))?;
        let options = UpdateOptions::builder().upsert(true).build();

        let result = self
            .db
            .collection(&record.table)
            .update_one(
                doc! {"_id": &record.migration_id},
                doc! {"$setOnInsert": document},
                options,
            )
            .await;

        match result {
            Ok(outcome) if outcome.upserted_id.is_some() => Ok(InsertOutcome::Inserted),
            Ok(_) => Ok(InsertOutcome::AlreadyPresent),
            // Two concurrent upserts on the same key: the loser sees a duplicate key.
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}
