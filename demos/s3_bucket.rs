//! S3 bucket example
//!
//! Works against any S3-compatible store. Configure it with:
//!
//! ```text
//! S3_ENDPOINT=http://localhost:9000 S3_BUCKET=demo \
//! S3_ACCESS_KEY=minioadmin S3_SECRET_KEY=minioadmin \
//! cargo run --example s3_bucket
//! ```

use blobfs_core::{Bucket, ListOptions, S3Config, WriterOptions};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = S3Config::new(
        env_or("S3_ENDPOINT", "http://localhost:9000"),
        env_or("S3_BUCKET", "demo"),
        env_or("S3_REGION", "us-east-1"),
    )
    .with_credentials(
        env_or("S3_ACCESS_KEY", "minioadmin"),
        env_or("S3_SECRET_KEY", "minioadmin"),
    )
    .with_path_style(true);
    let bucket = Bucket::open_s3(config)?;

    // Small objects go up in one PUT
    bucket.upload(b"Hello from blobfs", "demo/hello.txt").await?;

    // Larger ones switch to a multipart upload
    let big = vec![b'x'; 12 * 1024 * 1024];
    let opts = WriterOptions {
        buffer_size: 5 * 1024 * 1024,
        max_concurrency: 4,
        ..Default::default()
    };
    bucket.write_all("demo/big.bin", &big, opts).await?;

    let mut iter = bucket.list(ListOptions::new().with_prefix("demo/"));
    while let Some(obj) = iter.next().await? {
        println!("{:<20} {:>10} bytes", obj.key, obj.size);
    }

    let head = bucket.new_range_reader("demo/hello.txt", 0, 5).await?.read_all().await?;
    println!("first bytes: {}", String::from_utf8_lossy(&head));

    let failures = bucket.delete_prefix("demo/").await;
    println!("cleanup failures: {}", failures.len());

    bucket.close().await?;
    Ok(())
}
