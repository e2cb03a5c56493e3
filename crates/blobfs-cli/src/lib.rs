//! # blobfs CLI
//!
//! Command line access to a blobfs bucket, plus a small read-only HTTP
//! file server built on [`blobfs_core::Bucket::serve`].
//!
//! The bucket comes from a config file (`blobfs.toml` by default) with
//! `BLOBFS_*` environment overrides, or from `--root <dir>` for a local
//! directory.

pub mod commands;
pub mod config;
pub mod error;
pub mod server;

pub use commands::Command;
pub use config::CliConfig;
pub use error::ApiError;
pub use server::{create_router, run_server};
