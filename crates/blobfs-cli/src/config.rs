//! CLI configuration

use blobfs_core::StorageConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Settings read from the config file and `BLOBFS_*` environment variables.
///
/// Nested keys use `__` in the environment, e.g.
/// `BLOBFS_STORAGE__DRIVER=s3` or `BLOBFS_STORAGE__BUCKET=media`.
#[derive(Clone, Debug, Deserialize)]
pub struct CliConfig {
    /// Address the file server binds to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the file server listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where the bucket lives
    pub storage: Option<StorageConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage: None,
        }
    }
}

impl CliConfig {
    /// Load `file` (any format the `config` crate knows, optional) with
    /// environment overrides on top
    pub fn load(file: &str) -> anyhow::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(file).required(false))
            .add_source(
                ::config::Environment::with_prefix("BLOBFS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// A `--root` flag wins over whatever storage was configured
    pub fn with_root(mut self, root: Option<PathBuf>) -> Self {
        if let Some(path) = root {
            self.storage = Some(StorageConfig::Local {
                path,
                create_dir: true,
                no_temp_dir: false,
                skip_metadata: false,
            });
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
port = 9100

[storage]
driver = "s3"
endpoint = "http://localhost:9000"
bucket = "media"
force_path_style = true
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = CliConfig::load(path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "127.0.0.1");
        match config.storage {
            Some(StorageConfig::S3 {
                bucket,
                force_path_style,
                region,
                ..
            }) => {
                assert_eq!(bucket, "media");
                assert!(force_path_style);
                assert_eq!(region, "us-east-1");
            }
            other => panic!("unexpected storage {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = CliConfig::load("/nonexistent/blobfs-config").unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_root_overrides_storage() {
        let config = CliConfig::default().with_root(Some(PathBuf::from("/tmp/blobs")));
        assert!(matches!(
            config.storage,
            Some(StorageConfig::Local { ref path, .. }) if path == &PathBuf::from("/tmp/blobs")
        ));
    }
}
