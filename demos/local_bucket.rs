//! Local bucket example
//!
//! This example demonstrates:
//! - Opening a bucket over a local directory
//! - Uploading files with detected content types
//! - Ranged and seeking reads
//! - Listing with a delimiter
//! - Deleting a whole prefix
//!
//! Run with: cargo run --example local_bucket

use blobfs_core::{Bucket, ListOptions, LocalOptions, WriterOptions};
use std::io::SeekFrom;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dir = std::env::temp_dir().join("blobfs-local-demo");
    let bucket = Bucket::open_local(&dir, LocalOptions::default().with_create_dir(true))?;
    println!("Bucket at {}\n", dir.display());

    // ==================== Writes ====================

    bucket.upload(b"Hello, blobfs!", "notes/hello.txt").await?;
    bucket
        .upload(b"<html><body>hi</body></html>", "site/index.html")
        .await?;

    let opts = WriterOptions::default()
        .with_content_type("application/json")
        .with_metadata("Owner", "demo");
    let mut writer = bucket.new_writer("data/config.json", opts).await?;
    writer.write(br#"{"app": "blobfs-demo","#).await?;
    writer.write(br#" "version": 1}"#).await?;
    writer.close().await?;

    for key in ["notes/hello.txt", "site/index.html", "data/config.json"] {
        let attrs = bucket.attributes(key).await?;
        println!("{:<20} {:>4} bytes  {}", key, attrs.size, attrs.content_type);
    }

    // ==================== Reads ====================

    let mut reader = bucket.new_range_reader("notes/hello.txt", 7, 6).await?;
    println!("\nrange 7..13: {}", String::from_utf8_lossy(&reader.read_all().await?));

    reader.seek(SeekFrom::Start(0))?;
    println!("after seek:  {}", String::from_utf8_lossy(&reader.read_all().await?));

    // ==================== Listing ====================

    println!("\nTop level:");
    let mut iter = bucket.list(ListOptions::new().with_delimiter("/"));
    while let Some(obj) = iter.next().await? {
        println!("  {}{}", obj.key, if obj.is_dir { "  (dir)" } else { "" });
    }

    // ==================== Cleanup ====================

    for prefix in ["notes/", "site/", "data/"] {
        let failures = bucket.delete_prefix(prefix).await;
        println!("deleted {} ({} failures)", prefix, failures.len());
    }

    bucket.close().await?;
    Ok(())
}
