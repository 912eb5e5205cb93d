//! Engine configuration
//!
//! Built-in defaults, overlaid by an optional TOML file (`JUDGE_CONFIG`) and
//! then by `JUDGE_*` environment variables. Every value is clamped to the
//! system ceilings after loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::core::LimitOverride;
use crate::sandbox::ExecutionLimits;

/// Hard upper bounds no configuration or request may exceed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemCeilings {
    pub compile_time_ms: u32,
    pub compile_memory_mb: u32,
    pub run_time_ms: u32,
    pub memory_mb: u32,
    pub output_cap_bytes: u64,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
}

impl Default for SystemCeilings {
    fn default() -> Self {
        Self {
            compile_time_ms: 60_000,
            compile_memory_mb: 4096,
            run_time_ms: 20_000,
            memory_mb: 2048,
            output_cap_bytes: 64 * 1024 * 1024,
            max_concurrent_jobs: 64,
            queue_capacity: 10_000,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_ms: u32,
    /// Compile memory limit in MB (default: 2048MB)
    pub compile_memory_mb: u32,
    /// Default run time limit per case in milliseconds
    pub run_time_ms: u32,
    /// Default memory limit per case in MB
    pub memory_mb: u32,
    /// Maximum captured bytes per stream
    pub output_cap_bytes: u64,
    /// Worker pool size
    pub max_concurrent_jobs: usize,
    /// Number of submissions that may wait for a worker
    pub queue_capacity: usize,
    /// Stop at the first failing case
    pub fail_fast: bool,
    /// Maximum number of per-case entries in a verdict
    pub max_case_details: usize,
    /// Maximum bytes of stderr / compile output surfaced to callers
    pub stderr_preview_bytes: usize,
    /// Maximum accepted source size
    pub max_source_bytes: usize,
    /// Wall-clock limit = cpu limit * factor + slack
    pub wall_time_factor: u32,
    pub wall_time_slack_ms: u32,
    pub ceilings: SystemCeilings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            compile_time_ms: 30_000,
            compile_memory_mb: 2048,
            run_time_ms: 2_000,
            memory_mb: 256,
            output_cap_bytes: 8 * 1024 * 1024,
            max_concurrent_jobs: workers,
            queue_capacity: 256,
            fail_fast: true,
            max_case_details: 64,
            stderr_preview_bytes: 4096,
            max_source_bytes: 64 * 1024,
            wall_time_factor: 2,
            wall_time_slack_ms: 1_000,
            ceilings: SystemCeilings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `JUDGE_CONFIG` (if set) and `JUDGE_*` variables
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("JUDGE_CONFIG") {
            Ok(path) => Self::from_toml_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Some(v) = env_parse("JUDGE_COMPILE_TIME_MS")? {
            config.compile_time_ms = v;
        }
        if let Some(v) = env_parse("JUDGE_COMPILE_MEMORY_MB")? {
            config.compile_memory_mb = v;
        }
        if let Some(v) = env_parse("JUDGE_RUN_TIME_MS")? {
            config.run_time_ms = v;
        }
        if let Some(v) = env_parse("JUDGE_MEMORY_MB")? {
            config.memory_mb = v;
        }
        if let Some(v) = env_parse("JUDGE_OUTPUT_CAP_BYTES")? {
            config.output_cap_bytes = v;
        }
        if let Some(v) = env_parse("JUDGE_MAX_CONCURRENT_JOBS")? {
            config.max_concurrent_jobs = v;
        }
        if let Some(v) = env_parse("JUDGE_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(v) = env_parse("JUDGE_FAIL_FAST")? {
            config.fail_fast = v;
        }

        Ok(config.clamped())
    }

    /// Parse a TOML configuration file; missing keys keep their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid engine config {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        Ok(config.clamped())
    }

    /// Clamp every value into `[1, ceiling]`
    pub fn clamped(mut self) -> Self {
        let c = self.ceilings.clone();
        self.compile_time_ms = clamp("compile_time_ms", self.compile_time_ms, c.compile_time_ms);
        self.compile_memory_mb =
            clamp("compile_memory_mb", self.compile_memory_mb, c.compile_memory_mb);
        self.run_time_ms = clamp("run_time_ms", self.run_time_ms, c.run_time_ms);
        self.memory_mb = clamp("memory_mb", self.memory_mb, c.memory_mb);
        self.output_cap_bytes =
            clamp("output_cap_bytes", self.output_cap_bytes, c.output_cap_bytes);
        self.max_concurrent_jobs = clamp(
            "max_concurrent_jobs",
            self.max_concurrent_jobs,
            c.max_concurrent_jobs,
        );
        if self.queue_capacity > c.queue_capacity {
            warn!(
                "queue_capacity={} exceeds ceiling {}, clamping",
                self.queue_capacity, c.queue_capacity
            );
            self.queue_capacity = c.queue_capacity;
        }
        self.wall_time_factor = self.wall_time_factor.max(1);
        self
    }

    /// Wall-clock ceiling derived from a CPU-time limit
    pub fn wall_time_for(&self, cpu_time_ms: u32) -> u32 {
        cpu_time_ms
            .saturating_mul(self.wall_time_factor)
            .saturating_add(self.wall_time_slack_ms)
    }

    /// Limits for the compile step
    pub fn compile_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            cpu_time_ms: self.compile_time_ms,
            wall_time_ms: self.wall_time_for(self.compile_time_ms),
            memory_mb: self.compile_memory_mb,
            output_cap_bytes: self.ceilings.output_cap_bytes,
            address_space_limit: false,
        }
    }

    /// Output cap after applying a request override
    pub fn output_cap_for(&self, limits: &LimitOverride) -> u64 {
        limits
            .output_cap_bytes
            .map(|cap| cap.clamp(1, self.ceilings.output_cap_bytes))
            .unwrap_or(self.output_cap_bytes)
    }

    /// Cap a run time limit to the ceiling
    pub fn cap_run_time(&self, time_ms: u32) -> u32 {
        time_ms.clamp(1, self.ceilings.run_time_ms)
    }

    /// Cap a memory limit to the ceiling
    pub fn cap_memory(&self, memory_mb: u32) -> u32 {
        memory_mb.clamp(1, self.ceilings.memory_mb)
    }
}

fn clamp<T>(name: &str, value: T, ceiling: T) -> T
where
    T: Ord + Copy + std::fmt::Display + From<u8>,
{
    if value > ceiling {
        warn!("{}={} exceeds ceiling {}, clamping", name, value, ceiling);
        ceiling
    } else {
        value.max(T::from(1))
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_within_ceilings() {
        let config = EngineConfig::default().clamped();
        assert_eq!(config.compile_time_ms, 30_000);
        assert_eq!(config.run_time_ms, 2_000);
        assert!(config.max_concurrent_jobs >= 1);
        assert!(config.fail_fast);
    }

    #[test]
    fn test_toml_overlay_and_clamp() {
        let config = EngineConfig::from_toml_str(
            r#"
run_time_ms = 999999
memory_mb = 512
queue_capacity = 3

[ceilings]
run_time_ms = 5000
"#,
        )
        .unwrap();
        assert_eq!(config.run_time_ms, 5000);
        assert_eq!(config.memory_mb, 512);
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.ceilings.memory_mb, 2048);
    }

    #[test]
    fn test_zero_is_raised_to_one() {
        let mut config = EngineConfig::default();
        config.max_concurrent_jobs = 0;
        config.run_time_ms = 0;
        let config = config.clamped();
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.run_time_ms, 1);
    }

    #[test]
    fn test_wall_time_and_output_cap() {
        let config = EngineConfig::default();
        assert_eq!(config.wall_time_for(1000), 3000);

        let request = LimitOverride {
            output_cap_bytes: Some(u64::MAX),
            ..Default::default()
        };
        assert_eq!(config.output_cap_for(&request), config.ceilings.output_cap_bytes);
        assert_eq!(
            config.output_cap_for(&LimitOverride::default()),
            config.output_cap_bytes
        );
    }
}
