use crate::file_validator::ALLOWED_MIME_TYPES;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Image analysis task supported by the service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Locate food items in a refrigerator photo
    ObjectDetection,
    /// Read line items and store details from a receipt
    BillExtraction,
}

impl Operation {
    pub const ALL: [Operation; 2] = [Operation::ObjectDetection, Operation::BillExtraction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ObjectDetection => "objectDetection",
            Operation::BillExtraction => "billExtraction",
        }
    }

    /// Prompt sent when the caller does not supply one
    pub fn default_prompt(&self) -> &'static str {
        match self {
            Operation::ObjectDetection => {
                "Analyze this refrigerator image. Identify all visible food items with their \
                 precise coordinates (0.0-1.0 normalized). Include confidence scores for each detection."
            }
            Operation::BillExtraction => {
                "Extract all information from this bill/receipt. Get item names, prices, \
                 quantities, units, store details, date, time, and total amount. Ensure high accuracy."
            }
        }
    }

    /// Response schema the model is asked to conform to.
    ///
    /// Uses the OpenAPI subset accepted by `generationConfig.responseSchema`.
    pub fn response_schema(&self) -> Value {
        match self {
            Operation::ObjectDetection => json!({
                "type": "OBJECT",
                "properties": {
                    "objects": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "properties": {
                                "name": { "type": "STRING" },
                                "coordinates": {
                                    "type": "OBJECT",
                                    "properties": {
                                        "xPoint": { "type": "NUMBER" },
                                        "yPoint": { "type": "NUMBER" }
                                    }
                                },
                                "confidence": { "type": "NUMBER" }
                            }
                        }
                    }
                }
            }),
            Operation::BillExtraction => json!({
                "type": "OBJECT",
                "properties": {
                    "items": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "properties": {
                                "name": { "type": "STRING" },
                                "value": { "type": "NUMBER" },
                                "quantity": { "type": "NUMBER" },
                                "confidence": { "type": "NUMBER" }
                            }
                        }
                    },
                    "date": { "type": "STRING" },
                    "time": { "type": "STRING" },
                    "store": { "type": "STRING" },
                    "address": { "type": "STRING" },
                    "phone": { "type": "STRING" },
                    "totalAmount": { "type": "NUMBER" }
                }
            }),
        }
    }

    /// Catalogue entry served by `GET /operations`
    pub fn descriptor(&self) -> OperationDescriptor {
        let (name, description, endpoint, example) = match self {
            Operation::ObjectDetection => (
                "Object Detection",
                "Analyze refrigerator images to identify all visible food items with their precise \
                 coordinates (0.0-1.0 normalized). Perfect for tracking inventory and finding items.",
                "/process/refrigerator",
                "Upload a photo of your refrigerator interior",
            ),
            Operation::BillExtraction => (
                "Bill Extraction",
                "Extract all information from bills and receipts including item names, prices, \
                 quantities, units, store details, date, time, and total amount. Great for expense tracking.",
                "/process/bill",
                "Upload a photo of a grocery receipt or bill",
            ),
        };

        OperationDescriptor {
            name,
            description,
            endpoint,
            supported_file_types: ALLOWED_MIME_TYPES.to_vec(),
            example,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an operation tag does not name a supported operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation: {tag}. Available operations: {}", available_operations())]
pub struct UnknownOperation {
    pub tag: String,
}

fn available_operations() -> String {
    Operation::ALL
        .iter()
        .map(Operation::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation { tag: s.to_string() })
    }
}

/// Public description of an operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub endpoint: &'static str,
    pub supported_file_types: Vec<&'static str>,
    pub example: &'static str,
}
