//! # blobfs
//!
//! A bucket of blobs over a pluggable storage driver.
//!
//! [`Bucket`] is what applications use. It checks arguments, normalizes
//! driver errors and adds behavior every driver shares:
//!
//! - **Writers** that sniff the content type from the first 512 bytes and
//!   verify an expected MD5 before committing
//! - **Readers** that can seek, re-opening the range at the new position
//! - **Listing** one object at a time or in full pages
//! - **File helpers**: [`Bucket::upload`], [`Bucket::serve`] and
//!   [`Bucket::delete_prefix`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use blobfs_core::{Bucket, ListOptions, LocalOptions, WriterOptions};
//!
//! let bucket = Bucket::open_local("/var/lib/blobs", LocalOptions::default().with_create_dir(true))?;
//! bucket.write_all("notes/today.txt", b"hello", WriterOptions::default()).await?;
//!
//! let mut iter = bucket.list(ListOptions::new().with_prefix("notes/"));
//! while let Some(obj) = iter.next().await? {
//!     println!("{} ({} bytes)", obj.key, obj.size);
//! }
//! bucket.close().await?;
//! ```

mod bucket;
mod config;
mod filesystem;
mod list;
mod reader;
mod sniff;
mod writer;

pub use bucket::Bucket;
pub use config::StorageConfig;
pub use filesystem::{SERVE_CACHE_CONTROL, SERVE_CSP};
pub use list::ListIterator;
pub use reader::Reader;
pub use sniff::detect_content_type;
pub use writer::Writer;

pub use blobfs_driver::{
    Attributes, BlobError, Driver, ListObject, ListOptions, ListPage, LocalDriver, LocalOptions,
    MetadataMode, ReaderAttributes, Result, S3Driver, S3DriverOptions, WriterOptions,
    DEFAULT_CONTENT_TYPE, DEFAULT_PAGE_SIZE,
};
pub use blobfs_s3::S3Config;
