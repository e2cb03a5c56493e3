//! Client error types

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, S3Error>;

/// Client errors
#[derive(Error, Debug)]
pub enum S3Error {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error reported by the object store
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// An uploader was asked to upload twice
    #[error("the uploader has already been used")]
    UsedUploader,

    /// IO error while reading an upload payload
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML encoding or decoding error
    #[error("XML error: {0}")]
    Xml(String),

    /// The request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The response was missing something required
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A multipart upload failed and so did its abort
    #[error("{source} (abort failed: {abort})")]
    AbortFailed {
        source: Box<S3Error>,
        abort: Box<S3Error>,
    },
}

impl S3Error {
    /// HTTP status of the underlying store response, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Response(err) => Some(err.status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            Self::AbortFailed { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Store error code (`NoSuchKey`, ...), if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Response(err) if !err.code.is_empty() => Some(&err.code),
            Self::AbortFailed { source, .. } => source.code(),
            _ => None,
        }
    }
}

impl From<quick_xml::DeError> for S3Error {
    fn from(err: quick_xml::DeError) -> Self {
        S3Error::Xml(err.to_string())
    }
}

impl From<quick_xml::SeError> for S3Error {
    fn from(err: quick_xml::SeError) -> Self {
        S3Error::Xml(err.to_string())
    }
}

/// A failed store response decoded from its XML error body
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub resource: String,
    /// Raw response body
    pub raw: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ErrorBody {
    code: String,
    message: String,
    request_id: String,
    resource: String,
}

impl ResponseError {
    /// Build an error from a response status and body.
    ///
    /// Empty or malformed bodies keep only the status and raw text.
    pub fn parse(status: u16, body: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(body).into_owned();
        let mut err = Self {
            status,
            raw,
            ..Default::default()
        };

        if !err.raw.trim().is_empty() {
            if let Ok(parsed) = quick_xml::de::from_str::<ErrorBody>(&err.raw) {
                err.code = parsed.code;
                err.message = parsed.message;
                err.request_id = parsed.request_id;
                err.resource = parsed.resource;
            }
        }

        err
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = if self.code.is_empty() {
            "S3ResponseError"
        } else {
            &self.code
        };
        write!(f, "{} {}: {}", self.status, code, self.message)?;
        if !self.raw.is_empty() {
            write!(f, "\n(RAW: {})", self.raw)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResponseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_error() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>NoSuchKey</Code>
    <Message>The specified key does not exist.</Message>
    <Resource>/bucket/missing.txt</Resource>
    <RequestId>4442587FB7D0A2F9</RequestId>
</Error>"#;

        let err = ResponseError::parse(404, xml.as_bytes());
        assert_eq!(err.status, 404);
        assert_eq!(err.code, "NoSuchKey");
        assert_eq!(err.message, "The specified key does not exist.");
        assert_eq!(err.request_id, "4442587FB7D0A2F9");
        assert_eq!(err.resource, "/bucket/missing.txt");
        assert!(err.to_string().starts_with("404 NoSuchKey: The specified key"));
    }

    #[test]
    fn test_parse_empty_and_garbage_bodies() {
        let err = ResponseError::parse(404, b"");
        assert_eq!(err.status, 404);
        assert!(err.code.is_empty());
        assert_eq!(err.to_string(), "404 S3ResponseError: ");

        let err = ResponseError::parse(502, b"<html>Bad Gateway");
        assert_eq!(err.status, 502);
        assert!(err.code.is_empty());
        assert_eq!(err.raw, "<html>Bad Gateway");
    }

    #[test]
    fn test_abort_failed_keeps_original_status() {
        let err = S3Error::AbortFailed {
            source: Box::new(ResponseError::parse(500, b"").into()),
            abort: Box::new(S3Error::InvalidResponse("boom".into())),
        };
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("abort failed: invalid response: boom"));
    }
}
