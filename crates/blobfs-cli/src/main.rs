//! blobfs - inspect and serve blob buckets

use blobfs_cli::{commands, CliConfig, Command};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blobfs")]
#[command(about = "Blob storage over a local directory or an S3 bucket")]
#[command(version)]
struct Args {
    /// Config file, with or without extension
    #[arg(short, long, default_value = "blobfs", env = "BLOBFS_CONFIG")]
    config: String,

    /// Use a local directory as the bucket, ignoring configured storage
    #[arg(short, long, env = "BLOBFS_ROOT")]
    root: Option<PathBuf>,

    /// Host for `serve`
    #[arg(short = 'H', long, env = "BLOBFS_HOST")]
    host: Option<String>,

    /// Port for `serve`
    #[arg(short, long, env = "BLOBFS_PORT")]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long, env = "BLOBFS_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logs go to stderr so `cat` output stays clean
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "blobfs_cli={lvl},blobfs_core={lvl},blobfs_driver={lvl},blobfs_s3={lvl},tower_http=info",
                    lvl = log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = CliConfig::load(&args.config)?.with_root(args.root);
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let Some(storage) = config.storage.as_ref() else {
        anyhow::bail!("no storage configured; pass --root <dir> or set [storage] in the config file");
    };
    tracing::debug!(?storage, "opening bucket");
    let bucket = storage.open()?;

    commands::run(&bucket, args.command, &config.bind_addr()).await
}
