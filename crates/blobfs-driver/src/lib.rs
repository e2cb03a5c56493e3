//! # blobfs driver
//!
//! The storage driver contract behind a blobfs bucket, plus its two
//! implementations.
//!
//! This crate provides:
//! - **Driver trait**: attributes, paged listing, ranged reads, typed writes,
//!   copy and delete
//! - **Local driver**: objects as files under a root directory, attributes
//!   in JSON sidecars, atomic writes through temp files
//! - **S3 driver**: objects in an S3-compatible store via `blobfs-s3`
//! - **Escaping**: reversible key and metadata escaping shared by both
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Bucket facade              │
//! ├─────────────────────────────────────────┤
//! │              Driver Trait               │
//! ├────────────────────┬────────────────────┤
//! │    LocalDriver     │      S3Driver      │
//! ├────────────────────┼────────────────────┤
//! │     filesystem     │     blobfs-s3      │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use blobfs_driver::{Driver, LocalDriver, LocalOptions, WriterOptions};
//!
//! let driver = LocalDriver::open("/var/lib/blobs", LocalOptions::default().with_create_dir(true))?;
//! let mut w = driver
//!     .new_typed_writer("docs/readme.txt", "text/plain", &WriterOptions::default())
//!     .await?;
//! w.write(b"hello").await?;
//! w.close().await?;
//! ```

pub mod error;
pub mod escape;
pub mod local;
pub mod s3;
pub mod types;

pub use error::{BlobError, Result};
pub use local::{LocalDriver, LocalOptions, MetadataMode};
pub use s3::{S3Driver, S3DriverOptions};
pub use types::*;

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// A storage backend.
///
/// Keys are plain strings. Drivers escape them as their backend requires
/// and unescape them again in listings, so callers never see the escaped
/// form. Errors should be passed through [`Driver::normalize_error`] before
/// inspecting them.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Attributes of the blob at `key`
    async fn attributes(&self, key: &str) -> Result<Attributes>;

    /// One page of a listing in key order
    async fn list_paged(&self, opts: &ListOptions) -> Result<ListPage>;

    /// Open `key` for reading `length` bytes from `offset`; `None` reads to
    /// the end. A zero length is valid and yields an empty body.
    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<DriverReader>;

    /// Start writing `key`. Nothing becomes visible until the returned
    /// writer is closed.
    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>>;

    /// Copy `src` to `dst`, replacing `dst`
    async fn copy(&self, dst: &str, src: &str) -> Result<()>;

    /// Delete `key`
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release backend resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Map a backend error onto the shared error kinds
    fn normalize_error(&self, err: BlobError) -> BlobError {
        err
    }
}

/// An in-progress write
#[async_trait]
pub trait DriverWriter: Send {
    /// Append `buf` to the blob
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Commit the blob
    async fn close(&mut self) -> Result<()>;

    /// Discard everything written so far
    async fn abort(&mut self) -> Result<()>;
}

/// Body stream plus the attributes known when it was opened
pub struct DriverReader {
    pub attributes: ReaderAttributes,
    pub body: Pin<Box<dyn AsyncRead + Send>>,
}

impl DriverReader {
    pub fn new(attributes: ReaderAttributes, body: impl AsyncRead + Send + 'static) -> Self {
        Self {
            attributes,
            body: Box::pin(body),
        }
    }
}

impl fmt::Debug for DriverReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverReader")
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}
