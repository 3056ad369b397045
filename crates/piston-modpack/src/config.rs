//! Centralized installer settings.
//! `InstallerConfig::default()` is the canonical configuration; a JSON file and a
//! handful of environment variables can override it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// URL Constants
pub const MODRINTH_API_URL: &str = "https://api.modrinth.com/v2";
pub const CURSEFORGE_API_URL: &str = "https://api.curseforge.com";
pub const CURSEFORGE_CDN_URL: &str = "https://edge.forgecdn.net/files";

pub const DEFAULT_USER_AGENT: &str = concat!("piston-modpack/", env!("CARGO_PKG_VERSION"));

pub const REQUEST_TIMEOUT_SECS: u64 = 120;
pub const PROCESSOR_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Worker-pool size for the file and dependency phases
    pub concurrency: usize,
    /// Attempts per candidate URL for transport failures
    pub max_retries: u32,
    /// Base delay for linear backoff between attempts
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub processor_timeout_secs: u64,
    pub user_agent: String,
    pub modrinth_api_url: String,
    pub curseforge_api_url: String,
    pub curseforge_api_key: Option<String>,
    /// Install required dependencies declared by resolved catalog versions
    pub resolve_transitive_dependencies: bool,
    /// Root for per-attempt temporary directories (defaults to the OS temp dir)
    pub temp_root: Option<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            processor_timeout_secs: PROCESSOR_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            modrinth_api_url: MODRINTH_API_URL.to_string(),
            curseforge_api_url: CURSEFORGE_API_URL.to_string(),
            curseforge_api_key: None,
            resolve_transitive_dependencies: true,
            temp_root: None,
        }
    }
}

impl InstallerConfig {
    /// Load a config file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Read installer config {:?}", path))?;
        let config: InstallerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Parse installer config {:?}", path))?;
        Ok(config.sanitized())
    }

    /// Overlay `PISTON_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("PISTON_CONCURRENCY") {
            match value.parse::<usize>() {
                Ok(n) => self.concurrency = n,
                Err(_) => log::warn!("Ignoring invalid PISTON_CONCURRENCY={}", value),
            }
        }
        if let Ok(key) = std::env::var("PISTON_CURSEFORGE_API_KEY") {
            if !key.is_empty() {
                self.curseforge_api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("PISTON_MODRINTH_API_URL") {
            self.modrinth_api_url = url;
        }
        self.sanitized()
    }

    fn sanitized(mut self) -> Self {
        if self.concurrency == 0 {
            log::warn!("concurrency of 0 is not usable, falling back to 1");
            self.concurrency = 1;
        }
        if self.max_retries == 0 {
            self.max_retries = 1;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms * attempt as u64)
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Shared HTTP client for catalog lookups and downloads.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.request_timeout())
            .build()
            .context("Failed to build HTTP client")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "concurrency": 3, "curseforge_api_key": "abc" }}"#).unwrap();

        let config = InstallerConfig::load(file.path()).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.curseforge_api_key.as_deref(), Some("abc"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.modrinth_api_url, MODRINTH_API_URL);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "concurrency": 0 }}"#).unwrap();
        let config = InstallerConfig::load(file.path()).unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn retry_delay_is_linear() {
        let config = InstallerConfig {
            retry_delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(250));
        assert_eq!(config.retry_delay(3), Duration::from_millis(750));
    }
}
