//! Pikit Processing Service
//!
//! HTTP service that sends uploaded photos to a generative model and stores
//! what it finds. Two operations are supported:
//!
//! - **Object detection**: locate food items in a refrigerator photo and store
//!   one record per item with normalized coordinates
//! - **Bill extraction**: read line items, store details and totals from a
//!   receipt and store them as a single record
//!
//! ## Request flow
//!
//! ```text
//! multipart upload
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ File         │────▶│ Model        │────▶│ Gemini       │
//! │ Validator    │     │ Service      │◀────│ generateContent
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │ Repository   │────▶│ Document     │
//!                      │ (records)    │     │ Store        │
//!                      └──────────────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      temporary upload removed
//! ```

pub mod api;
pub mod config;
pub mod document_store;
pub mod file_validator;
pub mod gemini_client;
pub mod model_service;
pub mod operations;
pub mod processor;
pub mod records;

pub use config::Config;
pub use document_store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore, StoreError};
pub use file_validator::{validate_file, UploadedFile, ValidationError};
pub use model_service::{GenerationRequest, GenerativeModel, ModelError, ModelService};
pub use operations::Operation;
pub use processor::{ImageProcessor, ProcessingError, ProcessingOutcome};
pub use records::{Bill, DetectedItem, Draft, Persisted, Repository};
