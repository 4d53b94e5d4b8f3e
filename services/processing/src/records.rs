//! Typed records persisted from model responses.
//!
//! A record starts life as a [`Draft`] and becomes [`Persisted`] once the
//! store has assigned it an identifier. Only persisted records can be updated.

use crate::document_store::{DocumentStore, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// A document type with a fixed home collection
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;
}

/// Food item located in a refrigerator photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedItem {
    pub name: String,
    /// Horizontal position, normalized 0-1
    pub x_point: f64,
    /// Vertical position, normalized 0-1
    pub y_point: f64,
    pub confidence: f64,
}

impl Record for DetectedItem {
    const COLLECTION: &'static str = "items";
}

/// Line item on a receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillLineItem {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Fields read from a bill or receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<BillLineItem>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
}

impl Record for Bill {
    const COLLECTION: &'static str = "bills";
}

/// `null` and a missing key both mean no line items
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Shape of an object detection model answer
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectDetectionResponse {
    pub objects: Vec<DetectedObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectedObject {
    pub name: String,
    pub coordinates: Coordinates,
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub x_point: f64,
    pub y_point: f64,
}

impl From<DetectedObject> for DetectedItem {
    fn from(object: DetectedObject) -> Self {
        Self {
            name: object.name,
            x_point: object.coordinates.x_point,
            y_point: object.coordinates.y_point,
            confidence: object.confidence,
        }
    }
}

/// A record that has not been written yet
#[derive(Debug, Clone, PartialEq)]
pub struct Draft<R>(R);

impl<R> Draft<R> {
    pub fn new(record: R) -> Self {
        Self(record)
    }

    pub fn into_inner(self) -> R {
        self.0
    }
}

/// A record carrying its store-assigned identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persisted<R> {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: R,
}

impl<R> Deref for Persisted<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.record
    }
}

impl<R> DerefMut for Persisted<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.record
    }
}

/// Typed access to records in a document store
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DocumentStore>,
}

impl Repository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Write a draft and return it with its new identifier
    #[instrument(skip(self, draft), fields(collection = R::COLLECTION))]
    pub async fn insert<R: Record>(&self, draft: Draft<R>) -> Result<Persisted<R>, StoreError> {
        let record = draft.into_inner();
        let document = serde_json::to_value(&record)?;
        let id = self.store.insert(R::COLLECTION, document).await?;

        debug!(id = %id, "Record inserted");
        metrics::counter!("processing.records.persisted", "collection" => R::COLLECTION)
            .increment(1);

        Ok(Persisted { id, record })
    }

    /// Overwrite an existing record, keeping its identifier
    #[instrument(skip(self, persisted), fields(collection = R::COLLECTION, id = %persisted.id))]
    pub async fn update<R: Record>(&self, persisted: &Persisted<R>) -> Result<(), StoreError> {
        let document = serde_json::to_value(&persisted.record)?;
        self.store
            .update(R::COLLECTION, persisted.id, document)
            .await
    }

    pub async fn find<R: Record>(&self, id: Uuid) -> Result<Option<Persisted<R>>, StoreError> {
        match self.store.get(R::COLLECTION, id).await? {
            Some(document) => Ok(Some(Persisted {
                id,
                record: serde_json::from_value(document)?,
            })),
            None => Ok(None),
        }
    }
}
