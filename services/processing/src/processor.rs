use crate::document_store::StoreError;
use crate::file_validator::{validate_file, UploadedFile, ValidationError};
use crate::model_service::{ModelService, ModelServiceError};
use crate::operations::Operation;
use crate::records::{Bill, DetectedItem, Draft, ObjectDetectionResponse, Record, Repository};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Underlying reason a processing request failed
#[derive(Error, Debug)]
pub enum FailureCause {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to read uploaded file: {0}")]
    Read(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelServiceError),
}

/// Errors returned by [`ImageProcessor`]
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("{operation} processing failed: {cause}")]
    Failed {
        operation: Operation,
        #[source]
        cause: FailureCause,
    },

    #[error("{operation} response does not match the expected shape: {source}")]
    UnexpectedResponse {
        operation: Operation,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to persist {collection} record: {source}")]
    Persistence {
        collection: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Result of a successful model run, echoed back to the caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutcome {
    pub success: bool,
    pub operation: Operation,
    pub model: String,
    pub response: Value,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
}

/// Validates uploads, runs them through the model and persists the results
pub struct ImageProcessor {
    model_service: ModelService,
    repository: Repository,
}

impl ImageProcessor {
    pub fn new(model_service: ModelService, repository: Repository) -> Self {
        Self {
            model_service,
            repository,
        }
    }

    /// Validate, read and analyse an upload.
    ///
    /// The temporary file is removed here only when this step fails.
    #[instrument(skip(self, file, custom_prompt))]
    pub async fn process_with_operation(
        &self,
        file: Option<&UploadedFile>,
        operation: Operation,
        custom_prompt: Option<&str>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        metrics::counter!("processing.requests", "operation" => operation.as_str()).increment(1);

        match self.analyse(file, operation, custom_prompt).await {
            Ok(outcome) => Ok(outcome),
            Err(cause) => {
                let cause = record_failure(operation, cause);
                if let Some(file) = file {
                    cleanup_file(&file.path).await;
                }
                Err(ProcessingError::Failed { operation, cause })
            }
        }
    }

    async fn analyse(
        &self,
        file: Option<&UploadedFile>,
        operation: Operation,
        custom_prompt: Option<&str>,
    ) -> Result<ProcessingOutcome, FailureCause> {
        let file = validate_file(file)?;
        let image = tokio::fs::read(&file.path).await?;

        let output = self
            .model_service
            .process_image(&image, &file.mime_type, operation, custom_prompt)
            .await?;

        Ok(ProcessingOutcome {
            success: true,
            operation,
            model: self.model_service.model_name().to_string(),
            response: output.response,
            file_name: file.original_name.clone(),
            file_size: file.size,
            mime_type: file.mime_type.clone(),
            timestamp: Utc::now(),
            prompt: output.prompt,
        })
    }

    /// Detect food items and store one record per detected object
    pub async fn detect_objects(
        &self,
        file: Option<UploadedFile>,
        custom_prompt: Option<&str>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let outcome = self
            .process_with_operation(file.as_ref(), Operation::ObjectDetection, custom_prompt)
            .await?;

        let stored = self.store_detected_items(&outcome).await;
        if let Some(file) = &file {
            cleanup_file(&file.path).await;
        }
        let count = stored.map_err(|e| record_failure(Operation::ObjectDetection, e))?;

        info!(items = count, file = %outcome.file_name, "Refrigerator items stored");
        Ok(outcome)
    }

    /// Extract bill fields and store them as a single record
    pub async fn extract_bill_data(
        &self,
        file: Option<UploadedFile>,
        custom_prompt: Option<&str>,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let outcome = self
            .process_with_operation(file.as_ref(), Operation::BillExtraction, custom_prompt)
            .await?;

        let stored = self.store_bill(&outcome).await;
        if let Some(file) = &file {
            cleanup_file(&file.path).await;
        }
        stored.map_err(|e| record_failure(Operation::BillExtraction, e))?;

        info!(file = %outcome.file_name, "Bill stored");
        Ok(outcome)
    }

    /// Inserts run concurrently; the first failure fails the whole batch and
    /// earlier successful inserts are left in place.
    async fn store_detected_items(&self, outcome: &ProcessingOutcome) -> Result<usize, ProcessingError> {
        let parsed: ObjectDetectionResponse = serde_json::from_value(outcome.response.clone())
            .map_err(|source| ProcessingError::UnexpectedResponse {
                operation: outcome.operation,
                source,
            })?;

        let inserts = parsed
            .objects
            .into_iter()
            .map(|object| self.repository.insert(Draft::new(DetectedItem::from(object))));

        let items = try_join_all(inserts)
            .await
            .map_err(|source| ProcessingError::Persistence {
                collection: DetectedItem::COLLECTION,
                source,
            })?;

        Ok(items.len())
    }

    async fn store_bill(&self, outcome: &ProcessingOutcome) -> Result<(), ProcessingError> {
        let bill: Bill = serde_json::from_value(outcome.response.clone()).map_err(|source| {
            ProcessingError::UnexpectedResponse {
                operation: outcome.operation,
                source,
            }
        })?;

        self.repository
            .insert(Draft::new(bill))
            .await
            .map_err(|source| ProcessingError::Persistence {
                collection: Bill::COLLECTION,
                source,
            })?;

        Ok(())
    }
}

/// Log and count a failed request, handing the error back
fn record_failure<E: std::fmt::Display>(operation: Operation, err: E) -> E {
    error!(operation = %operation, error = %err, "Image processing failed");
    metrics::counter!("processing.failures", "operation" => operation.as_str()).increment(1);
    err
}

/// Remove a temporary upload, logging rather than returning failures
pub async fn cleanup_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Cleaned up temporary file"),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to cleanup file");
            metrics::counter!("processing.cleanup.failures").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::{InMemoryDocumentStore, MockDocumentStore};
    use crate::model_service::{MockGenerativeModel, ModelError};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    const MILK_RESPONSE: &str = r#"{"objects":[{"name":"milk","coordinates":{"xPoint":0.1,"yPoint":0.2},"confidence":0.9}]}"#;

    fn write_upload(dir: &TempDir, mime_type: &str, size: usize) -> UploadedFile {
        let path = dir.path().join(Uuid::new_v4().simple().to_string());
        std::fs::write(&path, vec![0xFFu8; size]).unwrap();
        UploadedFile {
            path,
            original_name: "fridge.jpg".to_string(),
            mime_type: mime_type.to_string(),
            size: size as u64,
        }
    }

    fn model_returning(text: &'static str) -> MockGenerativeModel {
        let mut model = MockGenerativeModel::new();
        model
            .expect_generate_json()
            .times(1)
            .returning(move |_| Ok(text.to_string()));
        model
    }

    fn processor(model: MockGenerativeModel, store: Arc<dyn crate::document_store::DocumentStore>) -> ImageProcessor {
        ImageProcessor::new(
            ModelService::new(Arc::new(model), "gemini-2.5-flash"),
            Repository::new(store),
        )
    }

    #[tokio::test]
    async fn test_detect_objects_persists_each_object() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/jpeg", 2 * 1024 * 1024);
        let path = file.path.clone();
        let store = Arc::new(InMemoryDocumentStore::new());

        let outcome = processor(model_returning(MILK_RESPONSE), store.clone())
            .detect_objects(Some(file), None)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.operation, Operation::ObjectDetection);
        assert_eq!(outcome.model, "gemini-2.5-flash");
        assert_eq!(outcome.file_size, 2 * 1024 * 1024);
        assert_eq!(outcome.response["objects"].as_array().unwrap().len(), 1);
        assert_eq!(outcome.prompt, Operation::ObjectDetection.default_prompt());
        assert_eq!(store.count(DetectedItem::COLLECTION), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_item_count_matches_objects_len() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/png", 1024);
        let store = Arc::new(InMemoryDocumentStore::new());
        let response = r#"{"objects":[
            {"name":"milk","coordinates":{"xPoint":0.1,"yPoint":0.2},"confidence":0.9},
            {"name":"eggs","coordinates":{"xPoint":0.5,"yPoint":0.5},"confidence":0.8},
            {"name":"jam","coordinates":{"xPoint":0.9,"yPoint":0.7},"confidence":0.6}
        ]}"#;

        processor(model_returning(response), store.clone())
            .detect_objects(Some(file), None)
            .await
            .unwrap();

        assert_eq!(store.count(DetectedItem::COLLECTION), 3);
    }

    #[tokio::test]
    async fn test_extract_bill_persists_one_record() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/webp", 4096);
        let store = Arc::new(InMemoryDocumentStore::new());
        let response = r#"{"items":[{"name":"bread","value":2.5,"quantity":1,"confidence":0.95}],
            "date":"2024-03-01","time":"10:15","store":"Corner Shop","address":"1 High St",
            "phone":"555-0100","totalAmount":2.5}"#;

        let outcome = processor(model_returning(response), store.clone())
            .extract_bill_data(Some(file), Some("read the receipt"))
            .await
            .unwrap();

        assert_eq!(outcome.operation, Operation::BillExtraction);
        assert_eq!(outcome.prompt, "read the receipt");
        assert_eq!(store.count(Bill::COLLECTION), 1);
        assert_eq!(store.count(DetectedItem::COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_invalid_type_fails_before_model_call() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "application/pdf", 128);
        let path = file.path.clone();
        let mut model = MockGenerativeModel::new();
        model.expect_generate_json().never();

        let err = processor(model, Arc::new(InMemoryDocumentStore::new()))
            .detect_objects(Some(file), None)
            .await
            .unwrap_err();

        assert!(err
            .to_string()
            .starts_with("objectDetection processing failed: Invalid file type."));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_oversized_file_fails_before_model_call() {
        let dir = TempDir::new().unwrap();
        let mut file = write_upload(&dir, "image/jpeg", 16);
        file.size = 11 * 1024 * 1024;
        let mut model = MockGenerativeModel::new();
        model.expect_generate_json().never();

        let err = processor(model, Arc::new(InMemoryDocumentStore::new()))
            .extract_bill_data(Some(file), None)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "billExtraction processing failed: File too large. Maximum size is 10MB."
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_validation_error() {
        let mut model = MockGenerativeModel::new();
        model.expect_generate_json().never();

        let err = processor(model, Arc::new(InMemoryDocumentStore::new()))
            .detect_objects(None, None)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "objectDetection processing failed: No file provided"
        );
    }

    #[tokio::test]
    async fn test_model_failure_wraps_message_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/jpeg", 64);
        let path = file.path.clone();
        let mut model = MockGenerativeModel::new();
        model
            .expect_generate_json()
            .returning(|_| Err(ModelError::Request("connection reset".to_string())));
        let mut store = MockDocumentStore::new();
        store.expect_insert().never();

        let err = processor(model, Arc::new(store))
            .detect_objects(Some(file), None)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "objectDetection processing failed: objectDetection failed: Model request failed: connection reset"
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_mask_error() {
        let dir = TempDir::new().unwrap();
        let file = UploadedFile {
            path: dir.path().join("already-gone"),
            original_name: "fridge.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 10,
        };
        let mut model = MockGenerativeModel::new();
        model.expect_generate_json().never();

        let err = processor(model, Arc::new(InMemoryDocumentStore::new()))
            .detect_objects(Some(file), None)
            .await
            .unwrap_err();

        match err {
            ProcessingError::Failed {
                cause: FailureCause::Read(_),
                ..
            } => {}
            other => panic!("expected read failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_cleans_up_once() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/jpeg", 64);
        let path = file.path.clone();
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_, _| Err(StoreError::NotAnObject));

        let err = processor(model_returning(MILK_RESPONSE), Arc::new(store))
            .detect_objects(Some(file), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProcessingError::Persistence {
                collection: "items",
                ..
            }
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_partial_fan_out_failure_keeps_earlier_inserts() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/jpeg", 64);
        let path = file.path.clone();
        let response = r#"{"objects":[
            {"name":"milk","coordinates":{"xPoint":0.1,"yPoint":0.2},"confidence":0.9},
            {"name":"eggs","coordinates":{"xPoint":0.5,"yPoint":0.5},"confidence":0.8},
            {"name":"jam","coordinates":{"xPoint":0.9,"yPoint":0.7},"confidence":0.6}
        ]}"#;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockDocumentStore::new();
        store.expect_insert().times(3).returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 2 {
                Err(StoreError::NotAnObject)
            } else {
                Ok(Uuid::new_v4())
            }
        });

        let err = processor(model_returning(response), Arc::new(store))
            .detect_objects(Some(file), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProcessingError::Persistence {
                collection: "items",
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bill_with_null_items_is_stored() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/jpeg", 64);
        let store = Arc::new(InMemoryDocumentStore::new());

        processor(
            model_returning(r#"{"items":null,"store":"Shop","totalAmount":1.0}"#),
            store.clone(),
        )
        .extract_bill_data(Some(file), None)
        .await
        .unwrap();

        assert_eq!(store.count(Bill::COLLECTION), 1);
    }

    #[test]
    fn test_persistence_failure_counts_as_failure() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/png", 64);
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_, _| Err(StoreError::NotAnObject));
        let processor = processor(
            model_returning(r#"{"items":[],"store":"Shop"}"#),
            Arc::new(store),
        );

        let result = metrics::with_local_recorder(&recorder, || {
            runtime.block_on(processor.extract_bill_data(Some(file), None))
        });

        assert!(matches!(result, Err(ProcessingError::Persistence { .. })));
        let rendered = handle.render();
        assert!(rendered.lines().any(|line| {
            line.starts_with(r#"processing_failures{operation="billExtraction"}"#)
                && line.ends_with(" 1")
        }));
    }

    #[tokio::test]
    async fn test_response_without_objects_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/jpeg", 64);
        let path = file.path.clone();
        let store = Arc::new(InMemoryDocumentStore::new());

        let err = processor(model_returning(r#"{"items":[]}"#), store.clone())
            .detect_objects(Some(file), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::UnexpectedResponse { .. }));
        assert_eq!(store.count(DetectedItem::COLLECTION), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_process_with_operation_keeps_file_on_success() {
        let dir = TempDir::new().unwrap();
        let file = write_upload(&dir, "image/gif", 32);
        let mut store = MockDocumentStore::new();
        store.expect_insert().never();

        let outcome = processor(model_returning(r#"{"objects":[]}"#), Arc::new(store))
            .process_with_operation(Some(&file), Operation::ObjectDetection, None)
            .await
            .unwrap();

        assert_eq!(outcome.mime_type, "image/gif");
        assert_eq!(outcome.file_name, "fridge.jpg");
        assert!(file.path.exists());
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let outcome = ProcessingOutcome {
            success: true,
            operation: Operation::BillExtraction,
            model: "gemini-2.5-flash".to_string(),
            response: json!({}),
            file_name: "receipt.png".to_string(),
            file_size: 10,
            mime_type: "image/png".to_string(),
            timestamp: Utc::now(),
            prompt: "p".to_string(),
        };

        let value = serde_json::to_value(outcome).unwrap();
        assert_eq!(value["operation"], "billExtraction");
        assert_eq!(value["fileName"], "receipt.png");
        assert_eq!(value["fileSize"], 10);
        assert_eq!(value["mimeType"], "image/png");
    }
}
