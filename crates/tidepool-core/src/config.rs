//! tidepool.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. A handful of deployment tunables can be overridden from
//! the environment after the file is read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Data-size threshold above which an elastic pool is provisioned.
pub const ENV_DATA_THRESHOLD_GB: &str = "TIDEPOOL_DATA_THRESHOLD_GB";
/// Worker image, as `repository/name:tag`.
pub const ENV_WORKER_IMAGE: &str = "TIDEPOOL_WORKER_IMAGE";
/// Per-worker memory limit in GiB.
pub const ENV_MEMORY_LIMIT_GB: &str = "TIDEPOOL_MEMORY_LIMIT_GB";
/// Per-worker CPU limit in cores.
pub const ENV_CPU_LIMIT: &str = "TIDEPOOL_CPU_LIMIT";

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)/(.+):(.+)$").unwrap_or_else(|e| panic!("invalid image pattern: {e}"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TidepoolConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sizing: SizingConfig,
    pub render: RenderConfig,
    pub jobs: JobsConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tidepool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Jobs larger than this (GiB, over the projected variables) get an elastic pool.
    pub data_threshold_gb: f64,
    /// Memory limit per worker, GiB.
    pub memory_limit_gb: f64,
    /// CPU limit per worker, cores.
    pub cpu_limit: f64,
    pub worker_image: String,
    pub threads_per_worker: u32,
    /// How long to wait for a new pool's minimum workers.
    pub pool_ready_timeout_secs: u64,
    /// Node labels pool workers must be scheduled on.
    pub node_selector: BTreeMap<String, String>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            data_threshold_gb: 50.0,
            memory_limit_gb: 16.0,
            cpu_limit: 2.0,
            worker_image: "tidepool/tidepool-worker:latest".to_string(),
            threads_per_worker: 2,
            pool_ready_timeout_secs: 300,
            node_selector: BTreeMap::from([(
                "tidepool.io/instancegroup".to_string(),
                "compute".to_string(),
            )]),
        }
    }
}

impl SizingConfig {
    /// Parsed worker image reference.
    pub fn image(&self) -> Result<ImageRef, ConfigError> {
        ImageRef::parse(&self.worker_image)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Sample count above which results are aggregated instead of plotted point-wise.
    pub shade_threshold: usize,
    pub plot_width: u32,
    pub plot_height: u32,
    /// Target partition length (samples) of merged datasets.
    pub chunk_len: usize,
    /// Most one-second grid points a multi-dataset merge may allocate.
    pub max_grid_points: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            shade_threshold: 500_000,
            plot_width: 888,
            plot_height: 450,
            chunk_len: 86_400,
            max_grid_points: 31_622_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// How long terminal job records stay pollable.
    pub result_retention_secs: u64,
    /// Lifetime of a fingerprint → job pointer. Must be shorter than retention.
    pub dedup_ttl_secs: u64,
    pub max_concurrent_jobs: usize,
    pub purge_interval_secs: u64,
    /// Upper bound on fetching one dataset slice.
    pub fetch_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            result_retention_secs: 86_400,
            dedup_ttl_secs: 86_100,
            max_concurrent_jobs: 8,
            purge_interval_secs: 300,
            fetch_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory of `<dataset_id>.json` files.
    pub dir: Option<PathBuf>,
}

/// Container image coordinates for pool workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse `repository/name:tag`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let caps = IMAGE_PATTERN
            .captures(s.trim())
            .ok_or_else(|| ConfigError::Invalid(format!("worker image {s:?} is not repo/name:tag")))?;
        Ok(Self {
            repository: caps[1].to_string(),
            name: caps[2].to_string(),
            tag: caps[3].to_string(),
        })
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.tag)
    }
}

impl TidepoolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from an optional file, apply process environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup(ENV_DATA_THRESHOLD_GB) {
            self.sizing.data_threshold_gb = parse_number(ENV_DATA_THRESHOLD_GB, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_LIMIT_GB) {
            self.sizing.memory_limit_gb = parse_number(ENV_MEMORY_LIMIT_GB, &v)?;
        }
        if let Some(v) = lookup(ENV_CPU_LIMIT) {
            self.sizing.cpu_limit = parse_number(ENV_CPU_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKER_IMAGE) {
            self.sizing.worker_image = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizing = &self.sizing;
        if !(sizing.memory_limit_gb > 0.0) || !(sizing.cpu_limit > 0.0) {
            return Err(ConfigError::Invalid(
                "sizing.memory_limit_gb and sizing.cpu_limit must be positive".to_string(),
            ));
        }
        if sizing.threads_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "sizing.threads_per_worker must be at least 1".to_string(),
            ));
        }
        if !(sizing.data_threshold_gb >= 0.0) {
            return Err(ConfigError::Invalid(
                "sizing.data_threshold_gb must not be negative".to_string(),
            ));
        }
        sizing.image()?;

        let jobs = &self.jobs;
        if jobs.dedup_ttl_secs == 0 || jobs.dedup_ttl_secs >= jobs.result_retention_secs {
            return Err(ConfigError::Invalid(format!(
                "jobs.dedup_ttl_secs ({}) must be non-zero and shorter than jobs.result_retention_secs ({})",
                jobs.dedup_ttl_secs, jobs.result_retention_secs
            )));
        }
        if jobs.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "jobs.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if jobs.purge_interval_secs == 0 || jobs.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "jobs.purge_interval_secs and jobs.fetch_timeout_secs must be non-zero".to_string(),
            ));
        }

        let render = &self.render;
        if render.plot_width == 0
            || render.plot_height == 0
            || render.chunk_len == 0
            || render.max_grid_points == 0
        {
            return Err(ConfigError::Invalid(
                "render.plot_width, render.plot_height, render.chunk_len and render.max_grid_points must be non-zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::Invalid(format!("{key}={value:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = TidepoolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.render.shade_threshold, 500_000);
        assert_eq!(config.render.max_grid_points, 31_622_400);
        assert_eq!(config.sizing.data_threshold_gb, 50.0);
    }

    #[test]
    fn parse_partial_file() {
        let config = TidepoolConfig::from_toml_str(
            r#"
[server]
port = 9000

[sizing]
data_threshold_gb = 10
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sizing.data_threshold_gb, 10.0);
        assert_eq!(config.sizing.memory_limit_gb, 16.0);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_DATA_THRESHOLD_GB, "5"),
            (ENV_WORKER_IMAGE, "registry.local/ocean/worker:2024"),
        ]
        .into_iter()
        .collect();
        let mut config = TidepoolConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.sizing.data_threshold_gb, 5.0);
        let image = config.sizing.image().unwrap();
        assert_eq!(image.repository, "registry.local/ocean");
        assert_eq!(image.name, "worker");
        assert_eq!(image.tag, "2024");
    }

    #[test]
    fn non_numeric_env_is_rejected() {
        let mut config = TidepoolConfig::default();
        let err = config
            .apply_env(|k| (k == ENV_CPU_LIMIT).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn dedup_ttl_must_be_shorter_than_retention() {
        let mut config = TidepoolConfig::default();
        config.jobs.dedup_ttl_secs = config.jobs.result_retention_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_grid_limit_rejected() {
        let mut config = TidepoolConfig::default();
        config.render.max_grid_points = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_image_reference_rejected() {
        assert!(ImageRef::parse("no-tag-here").is_err());
        assert_eq!(
            ImageRef::parse("tidepool/worker:1.0").unwrap().to_string(),
            "tidepool/worker:1.0"
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidepool.toml");
        std::fs::write(&path, "[jobs]\nmax_concurrent_jobs = 2\n").unwrap();
        let config = TidepoolConfig::from_file(&path).unwrap();
        assert_eq!(config.jobs.max_concurrent_jobs, 2);
    }
}
