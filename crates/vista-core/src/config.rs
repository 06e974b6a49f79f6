//! Runtime configuration.
//!
//! Every tunable is operator-supplied through `VISTA_*` environment variables;
//! the defaults below only apply when a variable is unset.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Build dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Worker pool size for partitioned builds (`VISTA_BUILD_PARALLELISM`).
    pub parallelism: usize,
    /// Single-node mode disables partitioning (`VISTA_SINGLE_NODE`).
    pub single_node: bool,
    /// Rows per encoded block (`VISTA_BLOCK_ROWS`).
    pub block_rows: usize,
    /// Publish lock TTL in seconds (`VISTA_LOCK_TTL_SECS`).
    pub lock_ttl_secs: u64,
    /// Lock acquisition attempts (`VISTA_LOCK_MAX_RETRIES`).
    pub lock_max_retries: u32,
    /// Publish attempts when a concurrent publish raced ours (`VISTA_PUBLISH_RETRIES`).
    pub publish_retries: u32,
}

impl BuildConfig {
    /// Publish lock TTL.
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            single_node: false,
            block_rows: 10_000,
            lock_ttl_secs: 30,
            lock_max_retries: 5,
            publish_retries: 3,
        }
    }
}

/// Range partitioner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionConfig {
    /// Months of history before "now" covered by bounded temporal partitions
    /// (`VISTA_PARTITION_HISTORY_MONTHS`).
    pub history_months: u32,
    /// Years after "now" where the last temporal partition ends
    /// (`VISTA_PARTITION_HORIZON_YEARS`).
    pub horizon_years: u32,
    /// Explicit temporal interval size (`VISTA_PARTITION_INTERVAL_MONTHS`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_months: Option<u32>,
    /// Upper bound of the numeric domain (`VISTA_PARTITION_NUMERIC_MAX`).
    /// Numeric partitioning is disabled without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_max: Option<i64>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            history_months: 12,
            horizon_years: 100,
            interval_months: None,
            numeric_max: None,
        }
    }
}

/// Map/reduce read settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    /// Rows per streamed chunk (`VISTA_STREAM_CHUNK_ROWS`).
    pub stream_chunk_rows: usize,
    /// Map tasks run concurrently (`VISTA_MAP_CONCURRENCY`).
    pub map_concurrency: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stream_chunk_rows: 20_000,
            map_concurrency: num_cpus::get(),
        }
    }
}

/// Lifecycle manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Age after which an artifact is stale (`VISTA_FRESHNESS_SECS`).
    pub freshness_secs: u64,
    /// Age after which an artifact is expired (`VISTA_MAX_AGE_SECS`).
    pub max_age_secs: u64,
    /// Definitions kept in the in-process cache (`VISTA_DEFINITION_CACHE_CAPACITY`).
    pub definition_cache_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 3_600,
            max_age_secs: 86_400,
            definition_cache_capacity: 1_024,
        }
    }
}

/// Garbage collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcConfig {
    /// Minimum age of an unreferenced object before deletion (`VISTA_GC_DELAY_SECS`).
    pub delay_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { delay_secs: 900 }
    }
}

/// Complete vista configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VistaConfig {
    /// Build settings.
    #[serde(default)]
    pub build: BuildConfig,
    /// Partitioner settings.
    #[serde(default)]
    pub partition: PartitionConfig,
    /// Read settings.
    #[serde(default)]
    pub query: QueryConfig,
    /// Lifecycle settings.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// GC settings.
    #[serde(default)]
    pub gc: GcConfig,
}

impl VistaConfig {
    /// Loads configuration from `VISTA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the variable that failed to parse
    /// or the setting that failed validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`VistaConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(v) = env.parse::<usize>("VISTA_BUILD_PARALLELISM")? {
            config.build.parallelism = v;
        }
        if let Some(v) = env.bool("VISTA_SINGLE_NODE")? {
            config.build.single_node = v;
        }
        if let Some(v) = env.parse::<usize>("VISTA_BLOCK_ROWS")? {
            config.build.block_rows = v;
        }
        if let Some(v) = env.parse::<u64>("VISTA_LOCK_TTL_SECS")? {
            config.build.lock_ttl_secs = v;
        }
        if let Some(v) = env.parse::<u32>("VISTA_LOCK_MAX_RETRIES")? {
            config.build.lock_max_retries = v;
        }
        if let Some(v) = env.parse::<u32>("VISTA_PUBLISH_RETRIES")? {
            config.build.publish_retries = v;
        }

        if let Some(v) = env.parse::<u32>("VISTA_PARTITION_HISTORY_MONTHS")? {
            config.partition.history_months = v;
        }
        if let Some(v) = env.parse::<u32>("VISTA_PARTITION_HORIZON_YEARS")? {
            config.partition.horizon_years = v;
        }
        config.partition.interval_months = env.parse::<u32>("VISTA_PARTITION_INTERVAL_MONTHS")?;
        config.partition.numeric_max = env.parse::<i64>("VISTA_PARTITION_NUMERIC_MAX")?;

        if let Some(v) = env.parse::<usize>("VISTA_STREAM_CHUNK_ROWS")? {
            config.query.stream_chunk_rows = v;
        }
        if let Some(v) = env.parse::<usize>("VISTA_MAP_CONCURRENCY")? {
            config.query.map_concurrency = v;
        }

        if let Some(v) = env.parse::<u64>("VISTA_FRESHNESS_SECS")? {
            config.lifecycle.freshness_secs = v;
        }
        if let Some(v) = env.parse::<u64>("VISTA_MAX_AGE_SECS")? {
            config.lifecycle.max_age_secs = v;
        }
        if let Some(v) = env.parse::<usize>("VISTA_DEFINITION_CACHE_CAPACITY")? {
            config.lifecycle.definition_cache_capacity = v;
        }

        if let Some(v) = env.parse::<u64>("VISTA_GC_DELAY_SECS")? {
            config.gc.delay_secs = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.max_age_secs < self.lifecycle.freshness_secs {
            return Err(Error::InvalidInput(format!(
                "VISTA_MAX_AGE_SECS ({}) must be >= VISTA_FRESHNESS_SECS ({})",
                self.lifecycle.max_age_secs, self.lifecycle.freshness_secs
            )));
        }
        if self.build.block_rows == 0 {
            return Err(Error::InvalidInput("VISTA_BLOCK_ROWS must be > 0".into()));
        }
        if self.query.stream_chunk_rows == 0 {
            return Err(Error::InvalidInput(
                "VISTA_STREAM_CHUNK_ROWS must be > 0".into(),
            ));
        }
        if self.query.map_concurrency == 0 {
            return Err(Error::InvalidInput("VISTA_MAP_CONCURRENCY must be > 0".into()));
        }
        if self.lifecycle.definition_cache_capacity == 0 {
            return Err(Error::InvalidInput(
                "VISTA_DEFINITION_CACHE_CAPACITY must be > 0".into(),
            ));
        }
        if self.partition.interval_months == Some(0) {
            return Err(Error::InvalidInput(
                "VISTA_PARTITION_INTERVAL_MONTHS must be > 0".into(),
            ));
        }
        if self.partition.numeric_max.is_some_and(|max| max <= 0) {
            return Err(Error::InvalidInput(
                "VISTA_PARTITION_NUMERIC_MAX must be > 0".into(),
            ));
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>().map(Some).map_err(|e| {
            Error::InvalidInput(format!(
                "{name} must be a {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Some(true)),
            "false" | "0" | "no" | "n" => Ok(Some(false)),
            _ => Err(Error::InvalidInput(format!(
                "{name} must be a boolean (true/false/1/0)"
            ))),
        }
    }
}
