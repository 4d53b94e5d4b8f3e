use std::path::PathBuf;
use thiserror::Error;

/// MIME types accepted for processing
pub const ALLOWED_MIME_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/jpg",
];

/// Largest accepted upload (10MB)
pub const MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Reasons an upload is rejected before processing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No file provided")]
    MissingFile,

    #[error("Invalid file type. Allowed types: {}", ALLOWED_MIME_TYPES.join(", "))]
    InvalidType { mime_type: String },

    #[error("File too large. Maximum size is 10MB.")]
    TooLarge { size: u64 },
}

/// An upload spooled to a temporary file
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Location of the temporary copy
    pub path: PathBuf,
    /// File name as sent by the client
    pub original_name: String,
    /// Declared content type
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
}

/// Check an upload against the type allow-list and size ceiling
pub fn validate_file(file: Option<&UploadedFile>) -> Result<&UploadedFile, ValidationError> {
    let file = file.ok_or(ValidationError::MissingFile)?;

    if !ALLOWED_MIME_TYPES.contains(&file.mime_type.as_str()) {
        return Err(ValidationError::InvalidType {
            mime_type: file.mime_type.clone(),
        });
    }

    if file.size > MAX_FILE_SIZE_BYTES {
        return Err(ValidationError::TooLarge { size: file.size });
    }

    Ok(file)
}
