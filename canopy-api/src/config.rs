//! Cache Settings Module
//!
//! Loads the coordinator configuration and backend selection from `CANOPY_*`
//! environment variables, with defaults suited to local development.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use canopy_core::{
    BackoffStrategy, CanopyResult, ConfigError, CoordinatorConfig, ResourceType, RetryPolicy,
};

// ============================================================================
// BACKEND SELECTION
// ============================================================================

/// Which cache backend the process constructs at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Memory,
    Lmdb,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-memory" | "mem" => Ok(BackendKind::Memory),
            "lmdb" => Ok(BackendKind::Lmdb),
            other => Err(format!("expected memory or lmdb, got {}", other)),
        }
    }
}

// ============================================================================
// CACHE SETTINGS
// ============================================================================

/// Process-wide cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// TTLs, invalidation retry and default compute deadline.
    pub coordinator: CoordinatorConfig,

    /// Backend constructed once at startup.
    pub backend: BackendKind,

    /// Directory for LMDB files (only used by the LMDB backend).
    pub lmdb_path: PathBuf,

    /// LMDB memory map size in megabytes.
    pub lmdb_map_size_mb: usize,

    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            backend: BackendKind::Memory,
            lmdb_path: PathBuf::from("./data/canopy-cache"),
            lmdb_map_size_mb: 256,
            log_json: false,
        }
    }
}

impl CacheSettings {
    /// Create CacheSettings from environment variables.
    ///
    /// Environment variables:
    /// - `CANOPY_CACHE_BACKEND`: "memory" or "lmdb" (default: memory)
    /// - `CANOPY_LMDB_PATH`: LMDB directory (default: ./data/canopy-cache)
    /// - `CANOPY_LMDB_MAP_SIZE_MB`: memory map size (default: 256)
    /// - `CANOPY_TTL_<RESOURCE>_SECS`: TTL override, e.g. `CANOPY_TTL_PLANT_SECS=45`
    /// - `CANOPY_INVALIDATION_MAX_ATTEMPTS`: attempts per fan-out (default: 3)
    /// - `CANOPY_INVALIDATION_BACKOFF_BASE_MS`: first retry delay (default: 50)
    /// - `CANOPY_INVALIDATION_BACKOFF_MAX_MS`: retry delay cap (default: 2000)
    /// - `CANOPY_COMPUTE_DEADLINE_MS`: default compute deadline, "off" to disable (default: 10000)
    /// - `CANOPY_LOG_JSON`: "true" or "false" (default: false)
    pub fn from_env() -> CanopyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> CanopyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let backend = parse_or(&var, "CANOPY_CACHE_BACKEND", defaults.backend)?;
        let lmdb_path = var("CANOPY_LMDB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.lmdb_path);
        let lmdb_map_size_mb = parse_or(&var, "CANOPY_LMDB_MAP_SIZE_MB", defaults.lmdb_map_size_mb)?;
        let log_json = var("CANOPY_LOG_JSON")
            .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(defaults.log_json);

        let mut coordinator = defaults.coordinator;
        for resource in ResourceType::ALL {
            let key = format!("CANOPY_TTL_{}_SECS", resource.as_str().to_uppercase());
            if let Some(secs) = parse_opt::<u64, _>(&var, &key)? {
                coordinator.ttl.set_ttl(resource, Duration::from_secs(secs));
            }
        }

        let default_retry = RetryPolicy::default();
        let (default_base, default_max) = match default_retry.backoff {
            BackoffStrategy::Exponential { base, max, .. } => (base, max),
            _ => (Duration::from_millis(50), Duration::from_secs(2)),
        };
        let max_attempts = parse_or(
            &var,
            "CANOPY_INVALIDATION_MAX_ATTEMPTS",
            default_retry.max_attempts,
        )?;
        let base_ms = parse_or(
            &var,
            "CANOPY_INVALIDATION_BACKOFF_BASE_MS",
            default_base.as_millis() as u64,
        )?;
        let max_ms = parse_or(
            &var,
            "CANOPY_INVALIDATION_BACKOFF_MAX_MS",
            default_max.as_millis() as u64,
        )?;
        coordinator.invalidation_retry = RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(base_ms),
                multiplier: 2.0,
                max: Duration::from_millis(max_ms),
            },
        };

        if let Some(raw) = var("CANOPY_COMPUTE_DEADLINE_MS") {
            coordinator.default_compute_deadline = match raw.trim().to_lowercase().as_str() {
                "off" | "none" => None,
                value => Some(Duration::from_millis(parse_value(
                    "CANOPY_COMPUTE_DEADLINE_MS",
                    value,
                )?)),
            };
        }

        coordinator.validate()?;

        Ok(Self {
            coordinator,
            backend,
            lmdb_path,
            lmdb_map_size_mb,
            log_json,
        })
    }

    /// TTL for a view whose staleness class is `resource`.
    pub fn ttl_for(&self, resource: ResourceType) -> Duration {
        self.coordinator.ttl.ttl_for(resource)
    }
}

fn parse_value<T>(field: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_opt<T, V>(var: &V, field: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    var(field).map(|raw| parse_value(field, &raw)).transpose()
}

fn parse_or<T, V>(var: &V, field: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(var, field)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::CanopyError;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> CanopyResult<CacheSettings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CacheSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.backend, BackendKind::Memory);
        assert_eq!(settings.lmdb_map_size_mb, 256);
        assert!(!settings.log_json);
        assert_eq!(settings.ttl_for(ResourceType::Plant), Duration::from_secs(30));
        assert_eq!(settings.ttl_for(ResourceType::Product), Duration::from_secs(3600));
        assert_eq!(settings.coordinator.invalidation_retry.max_attempts, 3);
        assert_eq!(
            settings.coordinator.default_compute_deadline,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_overrides() {
        let settings = settings(&[
            ("CANOPY_CACHE_BACKEND", "LMDB"),
            ("CANOPY_LMDB_PATH", "/tmp/canopy"),
            ("CANOPY_TTL_PLANT_SECS", "45"),
            ("CANOPY_INVALIDATION_MAX_ATTEMPTS", "5"),
            ("CANOPY_COMPUTE_DEADLINE_MS", "off"),
            ("CANOPY_LOG_JSON", "1"),
        ])
        .unwrap();

        assert_eq!(settings.backend, BackendKind::Lmdb);
        assert_eq!(settings.lmdb_path, PathBuf::from("/tmp/canopy"));
        assert_eq!(settings.ttl_for(ResourceType::Plant), Duration::from_secs(45));
        assert_eq!(settings.ttl_for(ResourceType::Grow), Duration::from_secs(60));
        assert_eq!(settings.coordinator.invalidation_retry.max_attempts, 5);
        assert_eq!(settings.coordinator.default_compute_deadline, None);
        assert!(settings.log_json);
    }

    #[test]
    fn test_unparseable_value_is_reported() {
        let err = settings(&[("CANOPY_TTL_TASK_SECS", "soon")]).unwrap_err();
        match err {
            CanopyError::Config(ConfigError::InvalidValue { field, value, .. }) => {
                assert_eq!(field, "CANOPY_TTL_TASK_SECS");
                assert_eq!(value, "soon");
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_ttl_fails_validation() {
        assert!(settings(&[("CANOPY_TTL_STRAIN_SECS", "0")]).is_err());
        assert!(settings(&[("CANOPY_INVALIDATION_MAX_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn test_unknown_backend() {
        assert!(settings(&[("CANOPY_CACHE_BACKEND", "redis")]).is_err());
    }
}
