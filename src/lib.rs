//! blobfs: blob storage over a local directory or an S3-compatible store.
//!
//! Re-exports [`blobfs_core`]; see [`Bucket`] for the entry point.

pub use blobfs_core::*;
