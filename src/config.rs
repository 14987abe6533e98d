use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Namespace prepended to every table name (may be empty).
    #[serde(default)]
    pub table_prefix: String,
}

/// Engine traversal defaults
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_traversal_limit")]
    pub upstream_limit: u32,
    #[serde(default = "default_traversal_limit")]
    pub downstream_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upstream_limit: default_traversal_limit(),
            downstream_limit: default_traversal_limit(),
        }
    }
}

fn default_traversal_limit() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Looks for the config file in this order:
    /// 1. Path specified in COMPGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("COMPGRAPH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .context("Failed to parse config.toml")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.storage.db_path.as_os_str().is_empty() {
            anyhow::bail!("storage.db_path must not be empty");
        }

        // The prefix is interpolated into table names, so keep it to a safe
        // identifier charset.
        if !self
            .storage
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "storage.table_prefix may only contain alphanumerics and underscores: {:?}",
                self.storage.table_prefix
            );
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.storage.db_path
    }

    /// Get the table namespace prefix
    pub fn table_prefix(&self) -> &str {
        &self.storage.table_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(temp_dir: &TempDir, body: &str) -> PathBuf {
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_config_load_success() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
log_level = "debug"

[storage]
db_path = "./graph.db"
table_prefix = "cg_"

[engine]
upstream_limit = 3
"#,
        );
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.table_prefix(), "cg_");
        assert_eq!(config.engine.upstream_limit, 3);
        // Unset values fall back to defaults
        assert_eq!(config.engine.downstream_limit, 10);
    }

    #[test]
    fn test_config_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[storage]
db_path = "./graph.db"
"#,
        );
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.table_prefix(), "");
        assert_eq!(config.engine.upstream_limit, 10);
        assert_eq!(config.engine.downstream_limit, 10);
    }

    #[test]
    fn test_config_rejects_bad_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[storage]
db_path = "./graph.db"
table_prefix = "bad prefix;"
"#,
        );
        let result = Config::load_from(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("table_prefix"));
    }

    #[test]
    fn test_config_missing_file() {
        let result = Config::load_from(Path::new("nonexistent.toml"));
        assert!(result.is_err());
    }
}
