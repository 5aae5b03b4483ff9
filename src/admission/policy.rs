//! Rate limit policy configuration and lookup.
//!
//! Policies are declared once at startup: an explicit entry per principal
//! plus an optional aggregate default applied to every entity whose
//! principal has no entry of its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AdmissionError, Result};

/// Longest spacing between two scheduled completions, about thirty years.
///
/// Slower rates are refused when the table is built; keeping the spacing
/// bounded keeps every scheduled instant representable.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86400 * 365 * 30);

/// Rate and capacity for one bucket.
///
/// A missing `qps` means unlimited; a missing `capacity` means the number of
/// outstanding messages is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Messages per second
    #[serde(default)]
    pub qps: Option<f64>,
    /// Maximum number of admitted but unreleased messages
    #[serde(default)]
    pub capacity: Option<u64>,
}

impl RateLimitPolicy {
    /// A policy that never throttles.
    pub const UNLIMITED: Self = Self {
        qps: None,
        capacity: None,
    };

    /// Create a policy from an optional rate and capacity.
    pub fn new(qps: Option<f64>, capacity: Option<u64>) -> Self {
        Self { qps, capacity }
    }

    /// Create a rate-only policy with unbounded capacity.
    pub fn with_qps(qps: f64) -> Self {
        Self::new(Some(qps), None)
    }

    /// Whether this policy never throttles.
    pub fn is_unlimited(&self) -> bool {
        self.qps.is_none()
    }

    /// Spacing between two consecutive scheduled completions.
    ///
    /// Saturates at [`MAX_INTERVAL`] for rates too slow to represent.
    pub fn interval(&self) -> Option<Duration> {
        self.qps.map(|qps| {
            Duration::try_from_secs_f64(1.0 / qps)
                .map_or(MAX_INTERVAL, |interval| interval.min(MAX_INTERVAL))
        })
    }

    fn validate(&self, label: &str) -> Result<()> {
        if let Some(qps) = self.qps {
            if !qps.is_finite() || qps <= 0.0 {
                return Err(AdmissionError::Config(format!(
                    "{}: qps must be a positive number, got {}",
                    label, qps
                )));
            }
            match Duration::try_from_secs_f64(1.0 / qps) {
                Ok(interval) if interval <= MAX_INTERVAL => {}
                _ => {
                    return Err(AdmissionError::Config(format!(
                        "{}: qps {} is too small, one message would take longer than {} seconds",
                        label,
                        qps,
                        MAX_INTERVAL.as_secs()
                    )))
                }
            }
        } else if let Some(capacity) = self.capacity {
            warn!(
                policy = %label,
                capacity = capacity,
                "Capacity has no effect without qps"
            );
        }
        Ok(())
    }
}

/// One configured principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    /// The principal this limit applies to
    pub principal: String,
    /// Messages per second (unlimited if not set)
    #[serde(default)]
    pub qps: Option<f64>,
    /// Maximum outstanding messages (unbounded if not set)
    #[serde(default)]
    pub capacity: Option<u64>,
}

impl RateLimitEntry {
    /// The policy declared by this entry.
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.qps, self.capacity)
    }
}

/// The complete rate limit configuration surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Explicit per-principal limits
    #[serde(default)]
    pub limits: Vec<RateLimitEntry>,
    /// Rate shared by all entities without an explicit limit
    #[serde(default)]
    pub aggregate_default_qps: Option<f64>,
}

impl RateLimits {
    /// Create an empty configuration (everything unlimited).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rate limits from a YAML or JSON file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Parse rate limits from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse rate limits: {}", e)))
    }

    /// Parse rate limits from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse rate limits: {}", e)))
    }

    /// Validate the configuration and build the lookup table.
    pub fn into_table(self) -> Result<PolicyTable> {
        let mut explicit = HashMap::with_capacity(self.limits.len());

        for entry in self.limits {
            let policy = entry.policy();
            policy.validate(&entry.principal)?;
            if explicit.insert(entry.principal.clone(), policy).is_some() {
                return Err(AdmissionError::Config(format!(
                    "Duplicate rate limit for principal {}",
                    entry.principal
                )));
            }
        }

        let aggregate_default = self.aggregate_default_qps.map(RateLimitPolicy::with_qps);
        if let Some(policy) = &aggregate_default {
            policy.validate("aggregate_default")?;
        }

        Ok(PolicyTable {
            explicit,
            aggregate_default,
        })
    }
}

/// Which bucket an entity's principal maps to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    /// The principal has its own configured bucket.
    Explicit(RateLimitPolicy),
    /// The principal shares the aggregate default bucket.
    AggregateDefault(RateLimitPolicy),
    /// Nothing is configured; the principal is never throttled.
    Unlimited,
}

/// Validated, immutable policy lookup.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    explicit: HashMap<String, RateLimitPolicy>,
    aggregate_default: Option<RateLimitPolicy>,
}

impl PolicyTable {
    /// A table with no limits at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Resolve the bucket for a principal.
    ///
    /// Entities without a principal, or with a principal that has no explicit
    /// entry, fall back to the aggregate default and then to unlimited.
    pub fn resolve(&self, principal: Option<&str>) -> Resolution {
        if let Some(policy) = principal.and_then(|p| self.explicit.get(p)) {
            return Resolution::Explicit(*policy);
        }

        match self.aggregate_default {
            Some(policy) => Resolution::AggregateDefault(policy),
            None => Resolution::Unlimited,
        }
    }

    /// The aggregate default policy, if configured.
    pub fn aggregate_default(&self) -> Option<RateLimitPolicy> {
        self.aggregate_default
    }

    /// Explicit policies sorted by principal.
    pub fn explicit(&self) -> Vec<(&str, RateLimitPolicy)> {
        let mut policies: Vec<_> = self
            .explicit
            .iter()
            .map(|(principal, policy)| (principal.as_str(), *policy))
            .collect();
        policies.sort_by(|a, b| a.0.cmp(b.0));
        policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_limits() {
        let yaml = r#"
limits:
  - principal: framework1
    qps: 1
  - principal: framework2
    qps: 2.5
    capacity: 10
aggregate_default_qps: 0.5
"#;
        let limits = RateLimits::from_yaml(yaml).unwrap();
        assert_eq!(limits.limits.len(), 2);
        assert_eq!(limits.limits[1].policy(), RateLimitPolicy::new(Some(2.5), Some(10)));
        assert_eq!(limits.aggregate_default_qps, Some(0.5));
    }

    #[test]
    fn test_parse_json_limits() {
        let json = r#"{"limits": [{"principal": "test-principal", "qps": 1, "capacity": 2}]}"#;
        let limits = RateLimits::from_json(json).unwrap();
        assert_eq!(limits.limits[0].principal, "test-principal");
        assert_eq!(limits.limits[0].capacity, Some(2));
        assert_eq!(limits.aggregate_default_qps, None);
    }

    #[test]
    fn test_entry_without_qps_is_unlimited() {
        let limits = RateLimits::from_yaml("limits:\n  - principal: p\n").unwrap();
        let table = limits.into_table().unwrap();
        assert_eq!(
            table.resolve(Some("p")),
            Resolution::Explicit(RateLimitPolicy::UNLIMITED)
        );
    }

    #[test]
    fn test_resolve_fallbacks() {
        let limits = RateLimits {
            limits: vec![RateLimitEntry {
                principal: "framework1".to_string(),
                qps: Some(1.0),
                capacity: None,
            }],
            aggregate_default_qps: Some(0.5),
        };
        let table = limits.into_table().unwrap();

        assert_eq!(
            table.resolve(Some("framework1")),
            Resolution::Explicit(RateLimitPolicy::with_qps(1.0))
        );
        assert_eq!(
            table.resolve(Some("framework2")),
            Resolution::AggregateDefault(RateLimitPolicy::with_qps(0.5))
        );
        assert_eq!(
            table.resolve(None),
            Resolution::AggregateDefault(RateLimitPolicy::with_qps(0.5))
        );
    }

    #[test]
    fn test_resolve_without_default_is_unlimited() {
        let table = PolicyTable::unlimited();
        assert_eq!(table.resolve(Some("anyone")), Resolution::Unlimited);
        assert_eq!(table.resolve(None), Resolution::Unlimited);
    }

    #[test]
    fn test_duplicate_principal_rejected() {
        let yaml = r#"
limits:
  - principal: p
    qps: 1
  - principal: p
    qps: 2
"#;
        let err = RateLimits::from_yaml(yaml).unwrap().into_table().unwrap_err();
        assert!(matches!(err, AdmissionError::Config(_)));
    }

    #[test]
    fn test_invalid_qps_rejected() {
        for qps in [0.0, -1.0, f64::INFINITY, f64::NAN, 1e-20, f64::MIN_POSITIVE] {
            let limits = RateLimits {
                limits: vec![RateLimitEntry {
                    principal: "p".to_string(),
                    qps: Some(qps),
                    capacity: None,
                }],
                aggregate_default_qps: None,
            };
            assert!(limits.into_table().is_err(), "qps {} should be rejected", qps);
        }

        for qps in [0.0, 1e-20] {
            let limits = RateLimits {
                limits: Vec::new(),
                aggregate_default_qps: Some(qps),
            };
            assert!(
                matches!(limits.into_table(), Err(AdmissionError::Config(_))),
                "aggregate default qps {} should be rejected",
                qps
            );
        }
    }

    #[test]
    fn test_slowest_accepted_rate() {
        let slowest = 1.0 / MAX_INTERVAL.as_secs_f64();
        let limits = RateLimits {
            limits: vec![RateLimitEntry {
                principal: "p".to_string(),
                qps: Some(slowest * 1.001),
                capacity: None,
            }],
            aggregate_default_qps: None,
        };
        assert!(limits.into_table().is_ok());
    }

    #[test]
    fn test_interval() {
        assert_eq!(
            RateLimitPolicy::with_qps(2.0).interval(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(RateLimitPolicy::UNLIMITED.interval(), None);
        assert_eq!(
            RateLimitPolicy::with_qps(1e-20).interval(),
            Some(MAX_INTERVAL)
        );
    }

    #[test]
    fn test_explicit_sorted() {
        let limits = RateLimits::from_yaml(
            "limits:\n  - principal: b\n    qps: 1\n  - principal: a\n    qps: 2\n",
        )
        .unwrap();
        let table = limits.into_table().unwrap();
        let names: Vec<_> = table.explicit().into_iter().map(|(p, _)| p).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
