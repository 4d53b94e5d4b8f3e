use crate::operations::Operation;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Errors raised by a generative model client
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Request(String),

    #[error("Model returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Model response contained no text")]
    EmptyResponse,

    #[error("Model response is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A model failure tagged with the operation that triggered it
#[derive(Error, Debug)]
#[error("{operation} failed: {source}")]
pub struct ModelServiceError {
    pub operation: Operation,
    #[source]
    pub source: ModelError,
}

/// Everything the remote model needs for one call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    /// Base64-encoded image bytes
    pub image_base64: String,
    pub mime_type: String,
    pub response_schema: Value,
}

/// Remote generative model returning JSON-shaped text
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate_json(&self, request: &GenerationRequest) -> Result<String, ModelError>;
}

/// Parsed model answer and the prompt that produced it
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub response: Value,
    pub prompt: String,
}

/// Builds model requests per operation and parses the JSON they return
pub struct ModelService {
    model: Arc<dyn GenerativeModel>,
    model_name: String,
}

impl ModelService {
    pub fn new(model: Arc<dyn GenerativeModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Run one image through the model for the given operation
    #[instrument(skip(self, image, custom_prompt), fields(model = %self.model_name, image_size = image.len()))]
    pub async fn process_image(
        &self,
        image: &[u8],
        mime_type: &str,
        operation: Operation,
        custom_prompt: Option<&str>,
    ) -> Result<ModelOutput, ModelServiceError> {
        info!(
            operation = %operation,
            mime_type = %mime_type,
            has_custom_prompt = custom_prompt.is_some(),
            "Processing image with AI model"
        );

        let prompt = custom_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| operation.default_prompt())
            .to_string();

        let request = GenerationRequest {
            model: self.model_name.clone(),
            prompt,
            image_base64: STANDARD.encode(image),
            mime_type: mime_type.to_string(),
            response_schema: operation.response_schema(),
        };

        let started = Instant::now();
        let result = self.call_model(&request).await;
        metrics::histogram!("processing.model.duration_seconds", "operation" => operation.as_str())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                info!(
                    operation = %operation,
                    response_size = response.to_string().len(),
                    "AI model processing completed"
                );
                Ok(ModelOutput {
                    response,
                    prompt: request.prompt,
                })
            }
            Err(source) => {
                error!(
                    operation = %operation,
                    mime_type = %mime_type,
                    error = %source,
                    "Error in AI model processing"
                );
                Err(ModelServiceError { operation, source })
            }
        }
    }

    async fn call_model(&self, request: &GenerationRequest) -> Result<Value, ModelError> {
        let text = self.model.generate_json(request).await?;
        Ok(serde_json::from_str(&text)?)
    }
}
