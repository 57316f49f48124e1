//! Coordinator configuration.
//!
//! TTLs are chosen per resource class. They only bound staleness for writes
//! that bypass the invalidation path; explicit invalidation is what makes a
//! specific write visible.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CanopyError, CanopyResult, ConfigError};
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::ResourceType;

/// Staleness upper bound for each resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    ttls: BTreeMap<ResourceType, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let ttls = ResourceType::ALL
            .into_iter()
            .map(|resource| (resource, Self::default_ttl(resource)))
            .collect();
        Self { ttls }
    }
}

impl TtlPolicy {
    /// Built-in TTL for a resource class.
    ///
    /// Plants and tasks change constantly during a grow; strains and products
    /// are catalog data that almost never change.
    pub fn default_ttl(resource: ResourceType) -> Duration {
        match resource {
            ResourceType::Grow => Duration::from_secs(60),
            ResourceType::Indoor => Duration::from_secs(300),
            ResourceType::Plant => Duration::from_secs(30),
            ResourceType::Strain => Duration::from_secs(3600),
            ResourceType::Product => Duration::from_secs(3600),
            ResourceType::Task => Duration::from_secs(30),
        }
    }

    /// TTL for a resource class.
    pub fn ttl_for(&self, resource: ResourceType) -> Duration {
        self.ttls
            .get(&resource)
            .copied()
            .unwrap_or_else(|| Self::default_ttl(resource))
    }

    /// Override the TTL for a resource class.
    pub fn with_ttl(mut self, resource: ResourceType, ttl: Duration) -> Self {
        self.ttls.insert(resource, ttl);
        self
    }

    pub fn set_ttl(&mut self, resource: ResourceType, ttl: Duration) {
        self.ttls.insert(resource, ttl);
    }
}

/// Master configuration for the cache coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub ttl: TtlPolicy,
    /// Retry policy for tag invalidation.
    pub invalidation_retry: RetryPolicy,
    /// Deadline applied to reads whose caller does not pass one.
    pub default_compute_deadline: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            invalidation_retry: RetryPolicy::default(),
            default_compute_deadline: Some(Duration::from_secs(10)),
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl_policy(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_invalidation_retry(mut self, retry: RetryPolicy) -> Self {
        self.invalidation_retry = retry;
        self
    }

    pub fn with_compute_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_compute_deadline = deadline;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CanopyResult<()> {
        for resource in ResourceType::ALL {
            let ttl = self.ttl.ttl_for(resource);
            if ttl.is_zero() {
                return Err(invalid(
                    format!("ttl.{}", resource),
                    "0s".to_string(),
                    "TTL must be greater than zero",
                ));
            }
        }

        if self.invalidation_retry.max_attempts == 0 {
            return Err(invalid(
                "invalidation_retry.max_attempts".to_string(),
                "0".to_string(),
                "at least one attempt is required",
            ));
        }

        if let BackoffStrategy::Exponential {
            base,
            multiplier,
            max,
        } = self.invalidation_retry.backoff
        {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(invalid(
                    "invalidation_retry.backoff.multiplier".to_string(),
                    multiplier.to_string(),
                    "multiplier must be a positive number",
                ));
            }
            if max < base {
                return Err(invalid(
                    "invalidation_retry.backoff.max".to_string(),
                    format!("{:?}", max),
                    "max backoff must not be below the base delay",
                ));
            }
        }

        if let Some(deadline) = self.default_compute_deadline {
            if deadline.is_zero() {
                return Err(invalid(
                    "default_compute_deadline".to_string(),
                    "0s".to_string(),
                    "deadline must be greater than zero when set",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: String, value: String, reason: &str) -> CanopyError {
    CanopyError::Config(ConfigError::InvalidValue {
        field,
        value,
        reason: reason.to_string(),
    })
}
