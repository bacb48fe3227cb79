use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Client settings read from `config.toml`. Flags and `HASHVAULT_*`
/// variables take precedence over every field.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Filesystem path or `s3://bucket/prefix`.
    pub store: Option<String>,
    pub client: Option<String>,
    pub s3_endpoint: Option<String>,
    /// Paths backed up when none are given on the command line.
    pub paths: Vec<PathBuf>,
    pub exclude: Vec<String>,
    pub concurrency: Option<usize>,
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hashvault").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// An explicit path must exist; the default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.concurrency == Some(0) {
            return Err(anyhow!("concurrency must be at least 1"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parses_all_fields() {
        let config = Config::parse(
            r#"
            store = "s3://backups/hosts"
            client = "web-01"
            s3_endpoint = "http://localhost:9000"
            paths = ["/etc", "/srv/www"]
            exclude = ["*.log", "cache/"]
            concurrency = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.store.as_deref(), Some("s3://backups/hosts"));
        assert_eq!(config.client.as_deref(), Some("web-01"));
        assert_eq!(config.paths, vec![PathBuf::from("/etc"), PathBuf::from("/srv/www")]);
        assert_eq!(config.exclude, vec!["*.log", "cache/"]);
        assert_eq!(config.concurrency, Some(4));
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_rejects_unknown_keys_and_zero_concurrency() {
        assert!(Config::parse("password = \"hunter2\"").is_err());
        assert!(Config::parse("concurrency = 0").is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "client = \"laptop\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.client.as_deref(), Some("laptop"));
    }
}
