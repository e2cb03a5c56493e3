//! Error types shared by every driver and the bucket facade

use blobfs_s3::S3Error;
use thiserror::Error;

/// Result type alias using `BlobError`
pub type Result<T> = std::result::Result<T, BlobError>;

/// Errors that can occur during blob storage operations
#[derive(Error, Debug)]
pub enum BlobError {
    /// Object (or bucket) does not exist
    #[error("blob not found: {key}")]
    NotFound {
        key: String,
        #[source]
        source: Option<Box<BlobError>>,
    },

    /// Operation attempted after the bucket was closed
    #[error("bucket is closed")]
    Closed,

    /// Invalid key, option or argument
    #[error("validation error: {0}")]
    Validation(String),

    /// Written bytes do not match the expected MD5
    #[error("content MD5 mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// S3 client error
    #[error("s3 error: {0}")]
    S3(#[from] S3Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Sidecar metadata could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BlobError {
    /// Not-found error for `key` without an underlying cause
    pub fn not_found(key: impl Into<String>) -> Self {
        BlobError::NotFound {
            key: key.into(),
            source: None,
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    /// Fill in the key of a not-found error produced without one
    pub fn with_key(self, key: &str) -> Self {
        match self {
            BlobError::NotFound { key: k, source } if k.is_empty() => BlobError::NotFound {
                key: key.to_string(),
                source,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for BlobError {
    fn from(err: serde_json::Error) -> Self {
        BlobError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BlobError {
    fn from(err: tokio::task::JoinError) -> Self {
        BlobError::Io(std::io::Error::other(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_with_key_only_fills_empty_keys() {
        let err = BlobError::NotFound {
            key: String::new(),
            source: Some(Box::new(BlobError::Validation("inner".into()))),
        }
        .with_key("a.txt");
        assert_eq!(err.to_string(), "blob not found: a.txt");
        assert!(err.source().is_some());

        let err = BlobError::not_found("b.txt").with_key("a.txt");
        assert_eq!(err.to_string(), "blob not found: b.txt");

        assert!(!BlobError::Closed.with_key("x").is_not_found());
    }
}
