//! Bucket subcommands

use crate::server::run_server;
use blobfs_core::{Bucket, ListOptions, WriterOptions};
use clap::Subcommand;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List blobs under a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
        /// List everything below the prefix instead of one level
        #[arg(short, long)]
        recursive: bool,
    },
    /// Print a blob to stdout
    Cat { key: String },
    /// Store a file (or stdin) as a blob
    Put {
        key: String,
        /// Source file; stdin when omitted
        file: Option<PathBuf>,
        /// Content type; detected from the content when omitted
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Copy a blob
    Cp { src: String, dst: String },
    /// Delete a blob
    Rm { key: String },
    /// Delete every blob under a prefix
    RmPrefix { prefix: String },
    /// Show a blob's attributes
    Stat { key: String },
    /// Serve the bucket over HTTP
    Serve,
}

/// Run `command` against `bucket`; `addr` is where `serve` listens
pub async fn run(bucket: &Bucket, command: Command, addr: &str) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    match command {
        Command::Ls { prefix, recursive } => {
            let mut opts = ListOptions::new().with_prefix(prefix);
            if !recursive {
                opts = opts.with_delimiter("/");
            }
            let mut iter = bucket.list(opts);
            while let Some(obj) = iter.next().await? {
                let line = if obj.is_dir {
                    format!("{:>12}  {:<25}  {}\n", "DIR", "", obj.key)
                } else {
                    let mod_time = obj
                        .mod_time
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    format!("{:>12}  {:<25}  {}\n", obj.size, mod_time, obj.key)
                };
                stdout.write_all(line.as_bytes()).await?;
            }
        }
        Command::Cat { key } => {
            let mut reader = bucket.new_reader(&key).await?;
            reader.write_to(&mut stdout).await?;
        }
        Command::Put {
            key,
            file,
            content_type,
        } => {
            let opts = WriterOptions {
                content_type,
                ..Default::default()
            };
            let mut writer = bucket.new_writer(&key, opts).await?;
            let written = match file {
                Some(path) => {
                    let mut file = tokio::fs::File::open(path).await?;
                    writer.read_from(&mut file).await?
                }
                None => writer.read_from(&mut tokio::io::stdin()).await?,
            };
            writer.close().await?;
            eprintln!("stored {} ({} bytes)", key, written);
        }
        Command::Cp { src, dst } => bucket.copy(&dst, &src).await?,
        Command::Rm { key } => bucket.delete(&key).await?,
        Command::RmPrefix { prefix } => {
            let failures = bucket.delete_prefix(&prefix).await;
            for err in &failures {
                warn!(error = %err, "delete failed");
            }
            if !failures.is_empty() {
                anyhow::bail!("{} deletions failed under {:?}", failures.len(), prefix);
            }
        }
        Command::Stat { key } => {
            let attrs = bucket.attributes(&key).await?;
            let mut out = format!(
                "key:            {}\nsize:           {}\ncontent-type:   {}\netag:           {}\n",
                key, attrs.size, attrs.content_type, attrs.etag
            );
            if let Some(mod_time) = attrs.mod_time {
                out.push_str(&format!("modified:       {}\n", mod_time.to_rfc3339()));
            }
            if let Some(md5) = &attrs.md5 {
                out.push_str(&format!("md5:            {}\n", hex::encode(md5)));
            }
            if let Some(cc) = &attrs.cache_control {
                out.push_str(&format!("cache-control:  {}\n", cc));
            }
            for (k, v) in &attrs.metadata {
                out.push_str(&format!("meta {}: {}\n", k, v));
            }
            stdout.write_all(out.as_bytes()).await?;
        }
        Command::Serve => return run_server(bucket.clone(), addr).await,
    }
    stdout.flush().await?;
    Ok(())
}
