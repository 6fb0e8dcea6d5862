use crate::errors::ConfigError;
use crate::model::{ComparisonPolicy, ProblemSpec};
use crate::sandbox::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod problem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub rate_limit: RateLimitConfig,
    pub comparison: ComparisonPolicy,
    pub cache: CacheConfig,
    pub validation: ValidationConfig,
    pub max_concurrent_sandboxes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            timeouts: TimeoutConfig::default(),
            rate_limit: RateLimitConfig::default(),
            comparison: ComparisonPolicy::default(),
            cache: CacheConfig::default(),
            validation: ValidationConfig::default(),
            max_concurrent_sandboxes: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_rows_per_table: u64,
    pub max_total_bytes: u64,
    pub max_tables: usize,
    pub max_result_rows: usize,
    pub preview_rows: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rows_per_table: 100_000,
            max_total_bytes: 64 * 1024 * 1024,
            max_tables: 16,
            max_result_rows: 10_000,
            preview_rows: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fetch_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub query_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
    pub margin_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 30_000,
            load_timeout_ms: 15_000,
            query_timeout_ms: 5_000,
            attempt_timeout_ms: None,
            margin_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Attempts allowed back to back before the window throttles.
    pub burst: u32,
    pub window_seconds: u64,
    pub max_concurrent_per_user: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            window_seconds: 60,
            max_concurrent_per_user: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_bytes: u64,
    /// Hard decode ceiling for a single remote object; problems cannot raise it.
    pub max_rows_per_object: u64,
    pub max_object_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024,
            max_rows_per_object: 1_000_000,
            max_object_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub sample_rows: usize,
    pub max_sample_bytes: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            sample_rows: 20,
            max_sample_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Limits and deadlines for one problem after overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub sandbox: SandboxLimits,
    pub comparison: ComparisonPolicy,
    pub preview_rows: usize,
    pub fetch_timeout: Duration,
    pub load_timeout: Duration,
    pub query_timeout: Duration,
    pub attempt_timeout: Duration,
}

impl EngineConfig {
    pub fn effective(&self, problem: &ProblemSpec) -> EffectiveSettings {
        let o = &problem.limits;
        let sandbox = SandboxLimits {
            max_rows_per_table: o
                .max_rows_per_table
                .unwrap_or(self.limits.max_rows_per_table)
                .min(self.cache.max_rows_per_object),
            max_total_bytes: o.max_total_bytes.unwrap_or(self.limits.max_total_bytes),
            max_tables: o.max_tables.unwrap_or(self.limits.max_tables),
            max_result_rows: o.max_result_rows.unwrap_or(self.limits.max_result_rows),
        };

        let query_ms = o.query_timeout_ms.unwrap_or(self.timeouts.query_timeout_ms);
        let t = &self.timeouts;
        // Second query slot covers a reference solution run.
        let attempt_ms = t.attempt_timeout_ms.unwrap_or(
            t.fetch_timeout_ms + t.load_timeout_ms + 2 * query_ms + t.margin_ms,
        );

        EffectiveSettings {
            sandbox,
            comparison: problem.comparison.unwrap_or(self.comparison),
            preview_rows: self.limits.preview_rows,
            fetch_timeout: Duration::from_millis(t.fetch_timeout_ms),
            load_timeout: Duration::from_millis(t.load_timeout_ms),
            query_timeout: Duration::from_millis(query_ms),
            attempt_timeout: Duration::from_millis(attempt_ms),
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg
    }

    /// Overlays `SQLGRADE_*` variables; unparsable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn set<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
            if let Some(v) = lookup(key) {
                if let Ok(n) = v.trim().parse() {
                    *slot = n;
                }
            }
        }

        let l: &dyn Fn(&str) -> Option<String> = &lookup;
        set(l, "SQLGRADE_MAX_ROWS_PER_TABLE", &mut self.limits.max_rows_per_table);
        set(l, "SQLGRADE_MAX_TOTAL_BYTES", &mut self.limits.max_total_bytes);
        set(l, "SQLGRADE_MAX_TABLES", &mut self.limits.max_tables);
        set(l, "SQLGRADE_MAX_RESULT_ROWS", &mut self.limits.max_result_rows);
        set(l, "SQLGRADE_QUERY_TIMEOUT_MS", &mut self.timeouts.query_timeout_ms);
        set(l, "SQLGRADE_FETCH_TIMEOUT_MS", &mut self.timeouts.fetch_timeout_ms);
        set(l, "SQLGRADE_RATE_BURST", &mut self.rate_limit.burst);
        set(l, "SQLGRADE_RATE_WINDOW_SECS", &mut self.rate_limit.window_seconds);
        set(l, "SQLGRADE_MAX_CONCURRENT", &mut self.max_concurrent_sandboxes);
        set(l, "SQLGRADE_CACHE_MAX_BYTES", &mut self.cache.max_bytes);
        if let Some(v) = lookup("SQLGRADE_ATTEMPT_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse() {
                self.timeouts.attempt_timeout_ms = Some(n);
            }
        }
    }
}

/// Loads the engine config file. Unknown keys are warned about, or rejected when `strict`.
pub fn load_engine_config(path: &Path, strict: bool) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let cfg: EngineConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    if !ignored_keys.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "Unknown fields detected in strict mode: {:?} (file: {})",
                ignored_keys,
                path.display()
            )));
        }
        tracing::warn!(
            event = "config_unknown_fields",
            fields = ?ignored_keys,
            file = %path.display(),
        );
    }

    if cfg.rate_limit.burst == 0 || cfg.rate_limit.window_seconds == 0 {
        return Err(ConfigError(
            "rate_limit.burst and rate_limit.window_seconds must be positive".into(),
        ));
    }
    if cfg.max_concurrent_sandboxes == 0 {
        return Err(ConfigError("max_concurrent_sandboxes must be positive".into()));
    }

    Ok(cfg)
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"limits:
  max_rows_per_table: 100000
  max_total_bytes: 67108864
  max_tables: 16
  max_result_rows: 10000
  preview_rows: 50
timeouts:
  fetch_timeout_ms: 30000
  load_timeout_ms: 15000
  query_timeout_ms: 5000
rate_limit:
  burst: 10
  window_seconds: 60
  max_concurrent_per_user: 2
comparison:
  row_order_sensitive: false
  float_tolerance: 0.000001
  case_sensitive_strings: true
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}
