//! Storage configuration

use crate::Bucket;
use blobfs_driver::{LocalOptions, MetadataMode, Result};
use blobfs_s3::S3Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Which backend a bucket lives on, and how to reach it
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        /// Root directory
        path: PathBuf,
        /// Create the root directory when missing
        #[serde(default = "default_true")]
        create_dir: bool,
        /// Stage writes next to their destination rather than in the
        /// system temp directory
        #[serde(default)]
        no_temp_dir: bool,
        /// Do not write `.attrs` sidecars
        #[serde(default)]
        skip_metadata: bool,
    },
    S3 {
        endpoint: String,
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        access_key: String,
        #[serde(default)]
        secret_key: String,
        #[serde(default)]
        force_path_style: bool,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl StorageConfig {
    /// Open the configured bucket
    pub fn open(&self) -> Result<Bucket> {
        match self {
            StorageConfig::Local {
                path,
                create_dir,
                no_temp_dir,
                skip_metadata,
            } => {
                let metadata = if *skip_metadata {
                    MetadataMode::Skip
                } else {
                    MetadataMode::Sidecar
                };
                let opts = LocalOptions::default()
                    .with_create_dir(*create_dir)
                    .with_no_temp_dir(*no_temp_dir)
                    .with_metadata(metadata);
                Bucket::open_local(path, opts)
            }
            StorageConfig::S3 {
                endpoint,
                bucket,
                region,
                access_key,
                secret_key,
                force_path_style,
                timeout_secs,
            } => Bucket::open_s3(
                S3Config::new(endpoint, bucket, region)
                    .with_credentials(access_key, secret_key)
                    .with_path_style(*force_path_style)
                    .with_timeout(Duration::from_secs(*timeout_secs)),
            ),
        }
    }
}

// Keeps the secret key out of logs
impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageConfig::Local {
                path,
                create_dir,
                no_temp_dir,
                skip_metadata,
            } => f
                .debug_struct("Local")
                .field("path", path)
                .field("create_dir", create_dir)
                .field("no_temp_dir", no_temp_dir)
                .field("skip_metadata", skip_metadata)
                .finish(),
            StorageConfig::S3 {
                endpoint,
                bucket,
                region,
                access_key,
                force_path_style,
                timeout_secs,
                ..
            } => f
                .debug_struct("S3")
                .field("endpoint", endpoint)
                .field("bucket", bucket)
                .field("region", region)
                .field("access_key", access_key)
                .field("secret_key", &"<redacted>")
                .field("force_path_style", force_path_style)
                .field("timeout_secs", timeout_secs)
                .finish(),
        }
    }
}
