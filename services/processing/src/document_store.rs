use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors raised by a document store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document {id} not found in collection {collection}")]
    NotFound { collection: String, id: Uuid },

    #[error("Document must be a JSON object")]
    NotAnObject,

    #[error("Failed to encode document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Collection-oriented JSON document storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a new document and return its generated identifier
    async fn insert(&self, collection: &str, document: Value) -> Result<Uuid, StoreError>;

    /// Replace the body of an existing document
    async fn update(&self, collection: &str, id: Uuid, document: Value) -> Result<(), StoreError>;

    /// Fetch a document body, including its timestamps
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>, StoreError>;

    /// Cheap connectivity probe
    async fn ping(&self) -> Result<(), StoreError>;
}

fn ensure_object(document: &Value) -> Result<(), StoreError> {
    if document.is_object() {
        Ok(())
    } else {
        Err(StoreError::NotAnObject)
    }
}

/// Attach `createdAt` / `updatedAt` to a stored body
fn with_timestamps(data: Value, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("createdAt".to_string(), Value::String(created_at.to_rfc3339()));
    map.insert("updatedAt".to_string(), Value::String(updated_at.to_rfc3339()));
    Value::Object(map)
}

/// Document store backed by a PostgreSQL JSONB table
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is required for the postgres backend")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, document))]
    async fn insert(&self, collection: &str, document: Value) -> Result<Uuid, StoreError> {
        ensure_object(&document)?;
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO documents (id, collection, data, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(collection)
        .bind(&document)
        .execute(&self.pool)
        .await?;

        debug!(id = %id, "Document inserted");
        Ok(id)
    }

    #[instrument(skip(self, document))]
    async fn update(&self, collection: &str, id: Uuid, document: Value) -> Result<(), StoreError> {
        ensure_object(&document)?;

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET data = $3, updated_at = NOW()
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&document)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id,
            });
        }

        debug!(id = %id, "Document updated");
        Ok(())
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>, StoreError> {
        let row: Option<(Value, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT data, created_at, updated_at
            FROM documents
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(data, created_at, updated_at)| with_timestamps(data, created_at, updated_at)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    data: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Process-local document store, used for development and tests
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, HashMap<Uuid, StoredDocument>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    #[cfg(test)]
    pub(crate) fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, collection: &str, document: Value) -> Result<Uuid, StoreError> {
        ensure_object(&document)?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(
                id,
                StoredDocument {
                    data: document,
                    created_at: now,
                    updated_at: now,
                },
            );

        Ok(id)
    }

    async fn update(&self, collection: &str, id: Uuid, document: Value) -> Result<(), StoreError> {
        ensure_object(&document)?;

        let mut collections = self.collections.write();
        let stored = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(&id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id,
            })?;

        stored.data = document;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(&id))
            .map(|doc| with_timestamps(doc.data.clone(), doc.created_at, doc.updated_at)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
