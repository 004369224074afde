use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use plandiff_pipeline::config::{AlignmentConfig, DiffConfig, PipelineConfig};

use crate::runner::RunnerConfig;

/// Errors raised while loading or validating [`WorkerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid worker configuration: {0}")]
    Constraint(String),
}

/// Which persistence and queue backend the worker runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local store and queue; nothing survives a restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// | Env Var                        | Default      |
/// |--------------------------------|--------------|
/// | `PLANDIFF_STORE`               | `postgres`   |
/// | `DATABASE_URL`                 | required for `postgres` |
/// | `DATABASE_MAX_CONNECTIONS`     | `10`         |
/// | `STORAGE_ROOT`                 | `./data`     |
/// | `WORKER_MAX_IN_FLIGHT`         | `3`          |
/// | `WORKER_MEMORY_BUDGET_MB`      | `500`        |
/// | `WORKER_WORKING_SET_MB`        | `128`        |
/// | `WORKER_MAX_LEASE_SECS`        | `1800`       |
/// | `WORKER_LEASE_EXTENSION_SECS`  | `60`         |
/// | `WORKER_POLL_INTERVAL_MS`      | `1000`       |
/// | `WORKER_SHUTDOWN_TIMEOUT_SECS` | `30`         |
///
/// Alignment and diff tunables (`SIFT_*`, `MATCH_RATIO`, `RANSAC_*`,
/// `ALIGN_*`, `DIFF_INTENSITY_THRESHOLD`, `REGION_*`) default to
/// [`PipelineConfig::default`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Root directory of the local object store.
    pub storage_root: PathBuf,
    pub max_in_flight: usize,
    pub memory_budget_mb: u64,
    /// Reserved per delivery for decoded rasters, on top of the payload.
    pub working_set_mb: u64,
    pub max_lease_secs: u64,
    pub lease_extension_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub pipeline: PipelineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Postgres,
            database_url: None,
            database_max_connections: 10,
            storage_root: PathBuf::from("./data"),
            max_in_flight: 3,
            memory_budget_mb: 500,
            working_set_mb: 128,
            max_lease_secs: 1800,
            lease_extension_secs: 60,
            poll_interval_ms: 1000,
            shutdown_timeout_secs: 30,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup and validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let align = AlignmentConfig::default();
        let diff = DiffConfig::default();
        let env = Env(&lookup);

        let config = Self {
            store_backend: env.parse("PLANDIFF_STORE", d.store_backend)?,
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            database_max_connections: env.parse("DATABASE_MAX_CONNECTIONS", d.database_max_connections)?,
            storage_root: lookup("STORAGE_ROOT").map(PathBuf::from).unwrap_or(d.storage_root),
            max_in_flight: env.parse("WORKER_MAX_IN_FLIGHT", d.max_in_flight)?,
            memory_budget_mb: env.parse("WORKER_MEMORY_BUDGET_MB", d.memory_budget_mb)?,
            working_set_mb: env.parse("WORKER_WORKING_SET_MB", d.working_set_mb)?,
            max_lease_secs: env.parse("WORKER_MAX_LEASE_SECS", d.max_lease_secs)?,
            lease_extension_secs: env.parse("WORKER_LEASE_EXTENSION_SECS", d.lease_extension_secs)?,
            poll_interval_ms: env.parse("WORKER_POLL_INTERVAL_MS", d.poll_interval_ms)?,
            shutdown_timeout_secs: env.parse("WORKER_SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout_secs)?,
            pipeline: PipelineConfig {
                alignment: AlignmentConfig {
                    max_features: env.parse("SIFT_MAX_FEATURES", align.max_features)?,
                    margin_fraction: env.parse("SIFT_MARGIN_FRACTION", align.margin_fraction)?,
                    max_dimension: env.parse("SIFT_MAX_DIMENSION", align.max_dimension)?,
                    ratio_threshold: env.parse("MATCH_RATIO", align.ratio_threshold)?,
                    ransac_reproj_threshold: env.parse("RANSAC_REPROJ_THRESHOLD", align.ransac_reproj_threshold)?,
                    ransac_max_iters: env.parse("RANSAC_MAX_ITERS", align.ransac_max_iters)?,
                    ransac_confidence: env.parse("RANSAC_CONFIDENCE", align.ransac_confidence)?,
                    ransac_seed: env.parse("RANSAC_SEED", align.ransac_seed)?,
                    scale_min: env.parse("ALIGN_SCALE_MIN", align.scale_min)?,
                    scale_max: env.parse("ALIGN_SCALE_MAX", align.scale_max)?,
                    rotation_min_deg: env.parse("ALIGN_ROTATION_MIN_DEG", align.rotation_min_deg)?,
                    rotation_max_deg: env.parse("ALIGN_ROTATION_MAX_DEG", align.rotation_max_deg)?,
                    min_confidence: env.parse("ALIGN_MIN_CONFIDENCE", align.min_confidence)?,
                },
                diff: DiffConfig {
                    intensity_threshold: env.parse("DIFF_INTENSITY_THRESHOLD", diff.intensity_threshold)?,
                    binarize_threshold: env.parse("REGION_BINARIZE_THRESHOLD", diff.binarize_threshold)?,
                    opening_kernel: env.parse("REGION_OPENING_KERNEL", diff.opening_kernel)?,
                    min_region_area: env.parse("REGION_MIN_AREA", diff.min_region_area)?,
                },
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_backend == StoreBackend::Postgres && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Constraint("max_in_flight must be at least 1".into()));
        }
        if self.memory_budget_mb == 0 {
            return Err(ConfigError::Constraint("memory_budget_mb must be at least 1".into()));
        }
        if self.working_set_mb > self.memory_budget_mb {
            return Err(ConfigError::Constraint(format!(
                "working_set_mb ({}) exceeds memory_budget_mb ({})",
                self.working_set_mb, self.memory_budget_mb
            )));
        }
        // Budgets are tracked in KiB permits.
        if self.memory_budget_mb * 1024 > u64::from(u32::MAX) {
            return Err(ConfigError::Constraint("memory_budget_mb is too large".into()));
        }
        if self.lease_extension_secs < 2 {
            return Err(ConfigError::Constraint("lease_extension_secs must be at least 2".into()));
        }
        if self.lease_extension_secs > self.max_lease_secs {
            return Err(ConfigError::Constraint(
                "lease_extension_secs must not exceed max_lease_secs".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Constraint("poll_interval_ms must be positive".into()));
        }
        self.pipeline
            .validate()
            .map_err(|e| ConfigError::Constraint(e.to_string()))
    }

    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_mb * 1024 * 1024
    }

    pub fn working_set_bytes(&self) -> u64 {
        self.working_set_mb * 1024 * 1024
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            lease_extension_secs: self.lease_extension_secs,
            max_lease_secs: self.max_lease_secs,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(var) {
            None => Ok(default),
            Some(value) if value.trim().is_empty() => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }
}
