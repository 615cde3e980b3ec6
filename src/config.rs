use serde::Deserialize;
use std::path::Path;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Object store connection settings
    pub storage: StorageConfig,

    /// Request resolution and rewriting settings
    #[serde(default)]
    pub serving: ServingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

/// Connection settings for the S3-compatible object store that holds
/// build output
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Store endpoint URL, e.g. "https://minio.example.com:9000"
    pub endpoint: String,

    /// Bucket holding build output
    pub bucket: String,

    /// Access key for request signing
    pub access_key: String,

    /// Secret key for request signing
    pub secret_key: String,

    /// Signing region (default: us-east-1; MinIO accepts any value)
    #[serde(default = "default_region")]
    pub region: String,

    /// Key prefix the build pipeline uploads under (default: __outputs)
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Store request timeout in seconds (default: 30)
    #[serde(default = "default_store_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServingConfig {
    /// Platform base domain. Requests whose hostname carries an extra
    /// label below this domain are routed in subdomain mode,
    /// e.g. "myproj.sites.example.com" under base domain "sites.example.com".
    /// Empty disables subdomain routing and every request is path-routed.
    #[serde(default)]
    pub base_domain: String,

    /// Cache lifetime for primary-path assets in seconds (default: 1 year)
    #[serde(default = "default_asset_max_age")]
    pub asset_max_age_secs: u64,

    /// Largest document the rewriter will buffer, in bytes (default: 4 MiB).
    /// Larger HTML/CSS bodies are streamed through unmodified.
    #[serde(default = "default_max_rewrite_bytes")]
    pub max_rewrite_bytes: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            base_domain: String::new(),
            asset_max_age_secs: default_asset_max_age(),
            max_rewrite_bytes: default_max_rewrite_bytes(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_output_prefix() -> String {
    "__outputs".to_string()
}

fn default_store_timeout() -> u64 {
    30
}

fn default_asset_max_age() -> u64 {
    31_536_000 // 1 year
}

fn default_max_rewrite_bytes() -> usize {
    4 * 1024 * 1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.storage.endpoint.is_empty() {
            errors.push("storage.endpoint must not be empty".to_string());
        } else if !self.storage.endpoint.starts_with("http://")
            && !self.storage.endpoint.starts_with("https://")
        {
            errors.push(format!(
                "storage.endpoint '{}' must start with http:// or https://",
                self.storage.endpoint
            ));
        }

        if self.storage.bucket.is_empty() {
            errors.push("storage.bucket must not be empty".to_string());
        }

        if self.storage.access_key.is_empty() {
            errors.push("storage.access_key must not be empty".to_string());
        }

        if self.storage.secret_key.is_empty() {
            errors.push("storage.secret_key must not be empty".to_string());
        }

        if self.storage.output_prefix.starts_with('/') || self.storage.output_prefix.ends_with('/')
        {
            errors.push(format!(
                "storage.output_prefix '{}' must not have leading or trailing slashes",
                self.storage.output_prefix
            ));
        }

        if self.serving.max_rewrite_bytes == 0 {
            errors.push("serving.max_rewrite_bytes must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_toml() -> &'static str {
        r#"
[storage]
endpoint = "http://127.0.0.1:9000"
bucket = "sites"
access_key = "minioadmin"
secret_key = "minioadmin"
"#
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"

[storage]
endpoint = "https://minio.example.com:9000"
bucket = "sites"
access_key = "AKIA123"
secret_key = "secret"
region = "eu-west-1"
output_prefix = "builds"

[serving]
base_domain = "sites.example.com"
asset_max_age_secs = 86400
max_rewrite_bytes = 1048576
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.storage.endpoint, "https://minio.example.com:9000");
        assert_eq!(config.storage.region, "eu-west-1");
        assert_eq!(config.storage.output_prefix, "builds");
        assert_eq!(config.serving.base_domain, "sites.example.com");
        assert_eq!(config.serving.asset_max_age_secs, 86400);
        assert_eq!(config.serving.max_rewrite_bytes, 1048576);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(storage_toml()).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.storage.output_prefix, "__outputs");
        assert_eq!(config.storage.request_timeout_secs, 30);
        assert_eq!(config.serving.base_domain, "");
        assert_eq!(config.serving.asset_max_age_secs, 31_536_000);
        assert_eq!(config.serving.max_rewrite_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_storage_section_is_required() {
        let result: Result<Config, _> = toml::from_str("");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_endpoint_scheme() {
        let toml = r#"
[storage]
endpoint = "minio.example.com:9000"
bucket = "sites"
access_key = "a"
secret_key = "b"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must start with http:// or https://"));
    }

    #[test]
    fn test_validate_empty_credentials() {
        let toml = r#"
[storage]
endpoint = "http://127.0.0.1:9000"
bucket = "sites"
access_key = ""
secret_key = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("storage.access_key must not be empty"));
        assert!(err.contains("storage.secret_key must not be empty"));
    }

    #[test]
    fn test_validate_output_prefix_slashes() {
        let toml = r#"
[storage]
endpoint = "http://127.0.0.1:9000"
bucket = "sites"
access_key = "a"
secret_key = "b"
output_prefix = "/__outputs/"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("leading or trailing slashes"));
    }

    #[test]
    fn test_validate_valid_config() {
        let config: Config = toml::from_str(storage_toml()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(storage_toml().as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.storage.bucket, "sites");
    }
}
