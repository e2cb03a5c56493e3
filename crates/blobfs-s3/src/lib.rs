//! # blobfs S3 client
//!
//! A small client for S3-compatible object stores. It covers only what a
//! blob storage driver needs:
//!
//! - **Signing**: AWS Signature Version 4 with the unsigned-payload mode
//! - **Objects**: head, get (ranged), put, copy, delete and `ListObjectsV2`
//! - **Multipart**: initiate, upload part, complete and abort
//! - **Uploader**: picks a single PUT or a concurrent multipart upload
//!
//! ## Example
//!
//! ```rust,ignore
//! use blobfs_s3::{S3Client, S3Config, Uploader};
//!
//! let client = S3Client::new(
//!     S3Config::new("https://s3.eu-central-1.amazonaws.com", "my-bucket", "eu-central-1")
//!         .with_credentials("AKIA...", "secret"),
//! )?;
//!
//! let mut uploader = Uploader::new(client.clone(), "reports/2024.csv", file);
//! uploader.upload().await?;
//!
//! let info = client.head_object("reports/2024.csv").await?;
//! println!("{} bytes", info.content_length);
//! ```

mod client;
mod config;
mod error;
mod signer;
mod types;
mod uploader;

pub use client::{GetObjectOutput, ListParams, S3Client};
pub use config::S3Config;
pub use error::{ResponseError, Result, S3Error};
pub use signer::{uri_encode, Signer, UNSIGNED_PAYLOAD};
pub use types::*;
pub use uploader::{UploadOutput, Uploader, DEFAULT_MAX_CONCURRENCY, DEFAULT_MIN_PART_SIZE};
