// src/config.rs

//! User settings
//!
//! Settings live in `<root>/config.json`. Every field has a default, so a
//! missing file (or a file that sets only a few keys) is fine; a file that
//! fails to parse is an error rather than being silently ignored.

use crate::download::RetryPolicy;
use crate::error::{Error, Result};
use crate::layout::Layout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Default catalog: name -> GitHub `owner/repo`
pub const DEFAULT_CATALOG_URL: &str =
    "https://raw.githubusercontent.com/cmerk2021/cmam/main/packages.json";

/// Default GitHub API base
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Repository that publishes cmam's own releases
pub const DEFAULT_SELF_LINK: &str = "cmerk2021/cmam";

/// Which catalog format the registry speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Catalog of GitHub repositories resolved through the releases API
    Releases,
    /// Single JSON index listing every version with its URL and digest
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistrySettings {
    pub kind: RegistryKind,
    pub url: String,
    pub api_url: String,
    pub self_link: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Releases,
            url: DEFAULT_CATALOG_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            self_link: DEFAULT_SELF_LINK.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    pub registry: RegistrySettings,
    /// Backups kept per package after a commit
    pub backup_retention: usize,
    pub download_retries: u32,
    pub retry_base_ms: u64,
    pub http_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub cache_max_age_days: u32,
    pub cache_max_bytes: u64,
    /// Shell profile that receives the PATH block (defaults to `~/.profile`;
    /// unused on Windows, where the user PATH lives in the registry)
    pub profile: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry: RegistrySettings::default(),
            backup_retention: 1,
            download_retries: 3,
            retry_base_ms: 500,
            http_timeout_secs: 30,
            lock_timeout_secs: 10,
            cache_max_age_days: 30,
            cache_max_bytes: 1024 * 1024 * 1024,
            profile: None,
        }
    }
}

impl Settings {
    /// Load `<root>/config.json`, falling back to defaults when absent
    pub fn load(layout: &Layout) -> Result<Self> {
        let path = layout.config_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::io(format!("Failed to read {}", path.display()), e)),
        };

        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.download_retries == 0 {
            return Err(Error::Config("downloadRetries must be at least 1".to_string()));
        }
        if self.registry.url.trim().is_empty() {
            return Err(Error::Config("registry.url must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.download_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_max_age_days) * 24 * 60 * 60)
    }

    pub fn profile_path(&self) -> Result<PathBuf> {
        if let Some(profile) = &self.profile {
            return Ok(profile.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".profile"))
            .ok_or_else(|| Error::Config("Could not determine the home directory".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> (tempfile::TempDir, Layout) {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        (temp, layout)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let (_temp, layout) = layout();
        let settings = Settings::load(&layout).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.backup_retention, 1);
        assert_eq!(settings.retry_policy().attempts, 3);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let (_temp, layout) = layout();
        fs::write(
            layout.config_path(),
            r#"{"backupRetention": 3, "registry": {"kind": "index", "url": "file:///srv/index.json"}}"#,
        )
        .unwrap();

        let settings = Settings::load(&layout).unwrap();
        assert_eq!(settings.backup_retention, 3);
        assert_eq!(settings.registry.kind, RegistryKind::Index);
        assert_eq!(settings.registry.api_url, DEFAULT_API_URL);
        assert_eq!(settings.lock_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let (_temp, layout) = layout();
        fs::write(layout.config_path(), r#"{"backupRetention": "many"}"#).unwrap();
        assert!(matches!(Settings::load(&layout), Err(Error::Config(_))));

        fs::write(layout.config_path(), r#"{"unknownKey": 1}"#).unwrap();
        assert!(matches!(Settings::load(&layout), Err(Error::Config(_))));

        fs::write(layout.config_path(), r#"{"downloadRetries": 0}"#).unwrap();
        assert!(matches!(Settings::load(&layout), Err(Error::Config(_))));
    }
}
