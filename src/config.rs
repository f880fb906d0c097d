use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory that object paths are resolved against.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("facematch/storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_endpoint() -> String {
    "http://127.0.0.1:8085/v1".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_provider_endpoint(),
            api_key: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Minimum similarity (0-100) when a job spec does not set one.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Concurrent provider calls per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_faces_per_image")]
    pub max_faces_per_image: u32,

    #[serde(default = "default_search_max_faces")]
    pub search_max_faces: u32,

    /// Wall-clock budget for one run; the job checkpoints when it elapses.
    /// Zero disables the deadline.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_similarity_threshold() -> f32 {
    80.0
}

fn default_batch_size() -> usize {
    5
}

fn default_max_faces_per_image() -> u32 {
    30
}

fn default_search_max_faces() -> u32 {
    10
}

fn default_deadline_secs() -> u64 {
    540
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            batch_size: default_batch_size(),
            max_faces_per_image: default_max_faces_per_image(),
            search_max_faces: default_search_max_faces(),
            deadline_secs: default_deadline_secs(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl JobsConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before retry `n` is `base_delay_ms * n`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facematch")
        .join("facematch.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage: StorageConfig::default(),
            provider: ProviderConfig::default(),
            jobs: JobsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEMATCH_CONFIG` or the default location, writing defaults
    /// on first run.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os("FACEMATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facematch")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [jobs]
            batch_size = 3

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.jobs.batch_size, 3);
        assert_eq!(config.jobs.similarity_threshold, 80.0);
        assert_eq!(config.jobs.max_faces_per_image, 30);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.jobs.image_extensions, vec!["jpg", "jpeg", "png"]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.provider.endpoint = "http://gateway:9000".to_string();
        config.jobs.deadline_secs = 0;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.provider.endpoint, "http://gateway:9000");
        assert_eq!(loaded.jobs.deadline(), None);
    }
}
