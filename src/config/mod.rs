//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or any
//! numeric var fails to parse. The database URL is wrapped in
//! `secrecy::SecretString` to keep it out of logs.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::cache::CacheConfig;
use crate::engine::{PipelineConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::pool::ScalingConfig;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub cache: CacheConfig,
    /// Default scaling bounds for every stage pool.
    pub pool: ScalingConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            max_size: parsed_var(&lookup, "CACHE_MAX_SIZE", cache_defaults.max_size)?,
            ttl: Duration::from_secs(parsed_var(
                &lookup,
                "CACHE_TTL",
                cache_defaults.ttl.as_secs(),
            )?),
        };

        let pool_defaults = ScalingConfig::default();
        let pool = ScalingConfig {
            min_workers: parsed_var(&lookup, "POOL_MIN_WORKERS", pool_defaults.min_workers)?,
            max_workers: parsed_var(&lookup, "POOL_MAX_WORKERS", pool_defaults.max_workers)?,
            cpu_threshold_high: parsed_var(
                &lookup,
                "CPU_THRESHOLD_HIGH",
                pool_defaults.cpu_threshold_high,
            )?,
            cpu_threshold_low: parsed_var(
                &lookup,
                "CPU_THRESHOLD_LOW",
                pool_defaults.cpu_threshold_low,
            )?,
            adjustment_interval: Duration::from_secs(positive_var(
                &lookup,
                "ADJUSTMENT_INTERVAL",
                pool_defaults.adjustment_interval.as_secs(),
            )?),
            ..pool_defaults
        }
        .normalized();

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            pipeline_name: lookup("PIPELINE_NAME").unwrap_or(pipeline_defaults.pipeline_name),
            records_per_page: parsed_var(
                &lookup,
                "RECORDS_PER_PAGE",
                pipeline_defaults.records_per_page,
            )?,
            max_records_per_run: parsed_var(
                &lookup,
                "MAX_RECORDS_PER_BATCH",
                pipeline_defaults.max_records_per_run,
            )?,
            write_batch_size: parsed_var(
                &lookup,
                "WRITE_BATCH_SIZE",
                pipeline_defaults.write_batch_size,
            )?,
            ..pipeline_defaults
        };

        let scheduler = SchedulerConfig {
            interval: Duration::from_secs(parsed_var(
                &lookup,
                "SCHEDULER_INTERVAL",
                SchedulerConfig::default().interval.as_secs(),
            )?),
            max_records: None,
        };

        Ok(Self {
            database_url: SecretString::from(required_var(&lookup, "DATABASE_URL")?),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            cache,
            pool,
            pipeline,
            scheduler,
        })
    }
}

fn required_var<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn positive_var<F>(lookup: &F, name: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match parsed_var(lookup, name, default)? {
        0 => Err(Error::Config(format!("{name} must be greater than zero"))),
        n => Ok(n),
    }
}

fn parsed_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
    }
}
