//! Client configuration

use std::time::Duration;

/// Connection settings for one S3 bucket
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Endpoint, with or without scheme (`https` is assumed when missing)
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Signing region
    pub region: String,
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
    /// Address the bucket as `endpoint/bucket` instead of `bucket.endpoint`
    pub use_path_style: bool,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.amazonaws.com".to_string(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            use_path_style: false,
            timeout: Duration::from_secs(60),
            user_agent: format!("blobfs-s3/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl S3Config {
    /// Create a new config for the given endpoint, bucket and region
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    /// Set the access credentials
    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = access_key.into();
        self.secret_key = secret_key.into();
        self
    }

    /// Use path-style addressing
    pub fn with_path_style(mut self, use_path_style: bool) -> Self {
        self.use_path_style = use_path_style;
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split the endpoint into scheme and host, dropping any trailing slash
    pub fn scheme_and_host(&self) -> (&str, &str) {
        let endpoint = self.endpoint.trim_end_matches('/');
        if let Some(host) = endpoint.strip_prefix("https://") {
            ("https", host)
        } else if let Some(host) = endpoint.strip_prefix("http://") {
            ("http", host)
        } else {
            ("https", endpoint)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_and_host() {
        let config = S3Config::new("http://localhost:9000/", "b", "us-east-1");
        assert_eq!(config.scheme_and_host(), ("http", "localhost:9000"));

        let config = S3Config::new("s3.example.com", "b", "us-east-1");
        assert_eq!(config.scheme_and_host(), ("https", "s3.example.com"));
    }
}
