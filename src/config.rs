use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Technology;
use crate::error::UploadError;

pub const CONFIG_FILE: &str = "sample-upload.json";

const DEFAULT_PART_SIZE_MB: u64 = 8;
const MIN_PART_SIZE_MB: u64 = 5;
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_MAX_PART_RETRIES: usize = 3;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<u64>,
    #[serde(default)]
    pub technology: Option<String>,
    #[serde(default)]
    pub host_genome: Option<String>,
    #[serde(default)]
    pub part_size_mb: Option<u64>,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
    #[serde(default)]
    pub max_part_retries: Option<usize>,
    #[serde(default)]
    pub object_store_endpoint: Option<String>,
    #[serde(default)]
    pub accelerate: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub base_url: Option<String>,
    pub project_id: Option<u64>,
    pub technology: Technology,
    pub host_genome: Option<String>,
    pub part_size: u64,
    pub heartbeat_interval: Duration,
    pub max_part_retries: usize,
    pub object_store_endpoint: Option<String>,
    pub accelerate: bool,
}

impl ResolvedConfig {
    pub fn require_base_url(&self) -> Result<&str, UploadError> {
        self.base_url
            .as_deref()
            .ok_or_else(|| UploadError::ConfigValue("base_url is required for uploads".to_string()))
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            base_url: None,
            project_id: None,
            technology: Technology::Illumina,
            host_genome: None,
            part_size: DEFAULT_PART_SIZE_MB * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_part_retries: DEFAULT_MAX_PART_RETRIES,
            object_store_endpoint: None,
            accelerate: false,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `sample-upload.json` from the working directory, or the
    /// per-user config file, in that order.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, UploadError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_path().ok_or(UploadError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| UploadError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| UploadError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but a missing default file yields the
    /// defaults. An explicit path must exist.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, UploadError> {
        match Self::resolve(path) {
            Err(UploadError::MissingConfig) => Ok(ResolvedConfig::default()),
            other => other,
        }
    }

    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        Self::user_config_path().filter(|path| path.exists())
    }

    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sample-upload")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, UploadError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let technology = match config.technology {
            Some(value) => value.parse::<Technology>()?,
            None => Technology::Illumina,
        };

        let part_size_mb = config.part_size_mb.unwrap_or(DEFAULT_PART_SIZE_MB);
        if part_size_mb < MIN_PART_SIZE_MB {
            return Err(UploadError::ConfigValue(format!(
                "part_size_mb must be at least {MIN_PART_SIZE_MB}, got {part_size_mb}"
            )));
        }

        let heartbeat_secs = config.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS);
        if heartbeat_secs == 0 {
            return Err(UploadError::ConfigValue(
                "heartbeat_secs must be positive".to_string(),
            ));
        }

        let base_url = config
            .base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Ok(ResolvedConfig {
            schema_version,
            base_url,
            project_id: config.project_id,
            technology,
            host_genome: config.host_genome.filter(|name| !name.trim().is_empty()),
            part_size: part_size_mb * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_part_retries: config.max_part_retries.unwrap_or(DEFAULT_MAX_PART_RETRIES),
            object_store_endpoint: config.object_store_endpoint,
            accelerate: config.accelerate.unwrap_or(false),
        })
    }

    pub fn write_default(path: &Path, base_url: &str) -> Result<(), UploadError> {
        let config = Config {
            schema_version: Some(1),
            base_url: Some(base_url.to_string()),
            ..Config::default()
        };
        let content = serde_json::to_string_pretty(&config)
            .map_err(|err| UploadError::ConfigParse(err.to_string()))?;
        fs::write(path, content).map_err(|err| UploadError::Filesystem(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.technology, Technology::Illumina);
        assert_eq!(resolved.part_size, 8 * 1024 * 1024);
        assert_eq!(resolved.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(resolved.max_part_retries, 3);
        assert!(!resolved.accelerate);
        assert!(resolved.require_base_url().is_err());
    }

    #[test]
    fn small_part_size_is_rejected() {
        let config = Config {
            part_size_mb: Some(4),
            ..Config::default()
        };
        assert!(matches!(
            ConfigLoader::resolve_config(config),
            Err(UploadError::ConfigValue(_))
        ));
    }
}
