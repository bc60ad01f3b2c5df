use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sanitize::OutlierPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "peer-review.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub scoring: OutlierPolicy,

    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Export tables are named `<table_prefix><evaluation id>`.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    #[serde(default = "default_top_groups")]
    pub top_groups: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            table_prefix: default_table_prefix(),
            top_groups: default_top_groups(),
        }
    }
}

fn default_table_prefix() -> String {
    "grades_".to_string()
}

fn default_top_groups() -> usize {
    10
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config
            .scoring
            .validate()
            .context("invalid [scoring] settings")?;
        Ok(config)
    }

    /// Explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn database_url(&self) -> Result<String> {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.database.url.clone())
            .context("DATABASE_URL must be set (or [database] url in peer-review.toml)")
    }
}
