// Marketplace and sink configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Public gallery query endpoint of the Visual Studio Code Marketplace
pub const DEFAULT_MARKETPLACE_URL: &str =
    "https://marketplace.visualstudio.com/_apis/public/gallery/extensionquery";

/// Query flags asking for statistics, categories and publisher details
pub const DEFAULT_QUERY_FLAGS: u32 = 870;

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_MAX_PAGES: u32 = 100;

/// Configuration for the paginated marketplace source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Query endpoint (POST)
    pub url: String,

    /// Extensions requested per page
    pub page_size: u32,

    /// Upper bound on pages walked in one run
    pub max_pages: u32,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Retries after the first attempt for a transient page failure
    pub max_retries: u32,

    /// First backoff delay in milliseconds; doubled on every retry
    pub backoff_base_ms: u64,

    /// Ceiling for a single backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Marketplace query flags
    pub flags: u32,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        MarketplaceConfig {
            url: DEFAULT_MARKETPLACE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1_000,
            max_backoff_ms: 30_000,
            flags: DEFAULT_QUERY_FLAGS,
            user_agent: format!("marketcrawl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl MarketplaceConfig {
    /// Create new config with builder pattern
    pub fn builder() -> MarketplaceConfigBuilder {
        MarketplaceConfigBuilder::default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Marketplace URL cannot be empty".to_string());
        }

        if self.page_size == 0 {
            return Err("Page size must be greater than 0".to_string());
        }

        if self.max_pages == 0 {
            return Err("Max pages must be greater than 0".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.max_backoff_ms < self.backoff_base_ms {
            return Err("Max backoff cannot be smaller than the base backoff".to_string());
        }

        Ok(())
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let default = MarketplaceConfig::default();

        MarketplaceConfig {
            url: std::env::var("MARKETPLACE_URL").unwrap_or(default.url),
            page_size: env_parse("MARKETPLACE_PAGE_SIZE").unwrap_or(default.page_size),
            max_pages: env_parse("MARKETPLACE_MAX_PAGES").unwrap_or(default.max_pages),
            timeout_secs: env_parse("MARKETPLACE_TIMEOUT_SECS").unwrap_or(default.timeout_secs),
            max_retries: env_parse("MARKETPLACE_MAX_RETRIES").unwrap_or(default.max_retries),
            backoff_base_ms: env_parse("MARKETPLACE_BACKOFF_MS").unwrap_or(default.backoff_base_ms),
            max_backoff_ms: env_parse("MARKETPLACE_MAX_BACKOFF_MS")
                .unwrap_or(default.max_backoff_ms),
            flags: env_parse("MARKETPLACE_FLAGS").unwrap_or(default.flags),
            user_agent: std::env::var("MARKETPLACE_USER_AGENT").unwrap_or(default.user_agent),
        }
    }
}

/// Builder for MarketplaceConfig
#[derive(Debug, Default)]
pub struct MarketplaceConfigBuilder {
    url: Option<String>,
    page_size: Option<u32>,
    max_pages: Option<u32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    flags: Option<u32>,
}

impl MarketplaceConfigBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn max_pages(mut self, pages: u32) -> Self {
        self.max_pages = Some(pages);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.backoff_base_ms = Some(base);
        self.max_backoff_ms = Some(max);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn build(self) -> MarketplaceConfig {
        let default = MarketplaceConfig::default();

        MarketplaceConfig {
            url: self.url.unwrap_or(default.url),
            page_size: self.page_size.unwrap_or(default.page_size),
            max_pages: self.max_pages.unwrap_or(default.max_pages),
            timeout_secs: self.timeout_secs.unwrap_or(default.timeout_secs),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(default.backoff_base_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(default.max_backoff_ms),
            flags: self.flags.unwrap_or(default.flags),
            user_agent: default.user_agent,
        }
    }
}

/// Where and how the ingestor persists batches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Append-only CSV file
    pub csv_path: PathBuf,

    /// SQLite connection URL for the relational sink
    pub database_url: String,

    /// Resumption cursor file
    pub cursor_path: PathBuf,

    /// Optional directory receiving one JSON file per raw page
    pub raw_dir: Option<PathBuf>,

    /// Timeout for one batch commit attempt, in seconds
    pub write_timeout_secs: u64,

    /// Retries after the first attempt for a failed batch commit
    pub max_retries: u32,

    /// First backoff delay in milliseconds; doubled on every retry
    pub backoff_base_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            csv_path: PathBuf::from("vscode_extensions.csv"),
            database_url: "sqlite:vscode_extensions.db".to_string(),
            cursor_path: PathBuf::from("marketcrawl.cursor.json"),
            raw_dir: None,
            write_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

impl SinkConfig {
    /// Sink configuration rooted in a single directory, as the tests use it
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        SinkConfig {
            csv_path: dir.join("vscode_extensions.csv"),
            database_url: format!("sqlite:{}", dir.join("vscode_extensions.db").display()),
            cursor_path: dir.join("marketcrawl.cursor.json"),
            ..SinkConfig::default()
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.csv_path.as_os_str().is_empty() {
            return Err("CSV path cannot be empty".to_string());
        }

        if !self.database_url.starts_with("sqlite:") {
            return Err(format!(
                "Database URL must be a sqlite: URL, got '{}'",
                self.database_url
            ));
        }

        if self.write_timeout_secs == 0 {
            return Err("Write timeout must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let default = SinkConfig::default();

        SinkConfig {
            csv_path: std::env::var("MARKETCRAWL_CSV_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.csv_path),
            database_url: std::env::var("MARKETCRAWL_DATABASE_URL").unwrap_or(default.database_url),
            cursor_path: std::env::var("MARKETCRAWL_CURSOR_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.cursor_path),
            raw_dir: std::env::var("MARKETCRAWL_RAW_DIR").ok().map(PathBuf::from),
            write_timeout_secs: env_parse("MARKETCRAWL_WRITE_TIMEOUT_SECS")
                .unwrap_or(default.write_timeout_secs),
            max_retries: env_parse("MARKETCRAWL_WRITE_RETRIES").unwrap_or(default.max_retries),
            backoff_base_ms: env_parse("MARKETCRAWL_WRITE_BACKOFF_MS")
                .unwrap_or(default.backoff_base_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MarketplaceConfig::default();
        assert_eq!(config.url, DEFAULT_MARKETPLACE_URL);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.flags, 870);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MarketplaceConfig::builder()
            .url("http://localhost:9999/query")
            .page_size(50)
            .max_retries(0)
            .backoff_ms(1, 4)
            .build();

        assert_eq!(config.url, "http://localhost:9999/query");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.backoff_base_ms, 1);
        assert_eq!(config.max_backoff_ms, 4);
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_validate() {
        let mut config = MarketplaceConfig::default();
        config.page_size = 0;
        assert!(config.validate().is_err());

        let config = MarketplaceConfig::builder().backoff_ms(100, 10).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sink_config_in_dir() {
        let config = SinkConfig::in_dir("/data/run");
        assert_eq!(config.csv_path, PathBuf::from("/data/run/vscode_extensions.csv"));
        assert_eq!(config.database_url, "sqlite:/data/run/vscode_extensions.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sink_config_rejects_non_sqlite_url() {
        let config = SinkConfig {
            database_url: "postgres://localhost/db".to_string(),
            ..SinkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
