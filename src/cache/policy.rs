//! Cache policies and refresh keys

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// How a cached result decides it is stale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefreshKeySpec {
    /// Stale once the entry is `every_secs` old
    Every { every_secs: u64 },
    /// Stale when the hashed result of a cheap key query changes.
    ///
    /// `every_secs` is how long the key query's own result is reused before
    /// it is executed again.
    Sql {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
        /// Data source of the key query, defaults to the main query's
        #[serde(default)]
        data_source: Option<String>,
        #[serde(default)]
        every_secs: Option<u64>,
    },
    /// Never stale once computed
    Immutable,
}

impl RefreshKeySpec {
    pub fn every(every: Duration) -> Self {
        RefreshKeySpec::Every {
            every_secs: every.as_secs(),
        }
    }

    pub fn sql(sql: impl Into<String>, params: Vec<Value>) -> Self {
        RefreshKeySpec::Sql {
            sql: sql.into(),
            params,
            data_source: None,
            every_secs: None,
        }
    }

    /// Builder method: how often a SQL key query is re-executed
    pub fn key_every(self, every: Duration) -> Self {
        match self {
            RefreshKeySpec::Sql {
                sql,
                params,
                data_source,
                ..
            } => RefreshKeySpec::Sql {
                sql,
                params,
                data_source,
                every_secs: Some(every.as_secs()),
            },
            other => other,
        }
    }

    /// Builder method: run a SQL key query on another data source
    pub fn on_data_source(self, name: impl Into<String>) -> Self {
        match self {
            RefreshKeySpec::Sql {
                sql,
                params,
                every_secs,
                ..
            } => RefreshKeySpec::Sql {
                sql,
                params,
                data_source: Some(name.into()),
                every_secs,
            },
            other => other,
        }
    }

    pub fn is_immutable(&self) -> bool {
        matches!(self, RefreshKeySpec::Immutable)
    }
}

impl Default for RefreshKeySpec {
    fn default() -> Self {
        RefreshKeySpec::Every { every_secs: 10 }
    }
}

/// Caching rules of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub refresh_key: RefreshKeySpec,

    /// Grace during which a stale entry is still served when renewal fails
    #[serde(default)]
    pub renewal_threshold_secs: Option<u64>,

    #[serde(default = "default_hard_expiration_secs")]
    pub hard_expiration_secs: u64,

    /// Overrides the queue's continue-wait timeout
    #[serde(default)]
    pub continue_wait_timeout_ms: Option<u64>,

    /// Wait for a stale entry's renewal instead of serving it and renewing
    /// in the background
    #[serde(default = "default_true")]
    pub wait_for_renew: bool,

    /// Skip the cache lookup; execution still goes through the queue
    #[serde(default)]
    pub force_no_cache: bool,

    /// Supersede the live job for this fingerprint
    #[serde(default)]
    pub force_renew: bool,

    #[serde(default)]
    pub priority: i32,
}

fn default_hard_expiration_secs() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            refresh_key: RefreshKeySpec::default(),
            renewal_threshold_secs: None,
            hard_expiration_secs: default_hard_expiration_secs(),
            continue_wait_timeout_ms: None,
            wait_for_renew: true,
            force_no_cache: false,
            force_renew: false,
            priority: 0,
        }
    }
}

impl CachePolicy {
    pub fn new(refresh_key: RefreshKeySpec) -> Self {
        Self {
            refresh_key,
            ..Default::default()
        }
    }

    pub fn renewal_threshold(mut self, threshold: Duration) -> Self {
        self.renewal_threshold_secs = Some(threshold.as_secs());
        self
    }

    pub fn hard_expiration(mut self, expiration: Duration) -> Self {
        self.hard_expiration_secs = expiration.as_secs();
        self
    }

    pub fn continue_wait_timeout(mut self, timeout: Duration) -> Self {
        self.continue_wait_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn wait_for_renew(mut self, wait: bool) -> Self {
        self.wait_for_renew = wait;
        self
    }

    pub fn force_no_cache(mut self, force: bool) -> Self {
        self.force_no_cache = force;
        self
    }

    pub fn force_renew(mut self, force: bool) -> Self {
        self.force_renew = force;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refresh_key_json_shape() {
        let spec: RefreshKeySpec = serde_json::from_value(json!({
            "type": "sql",
            "sql": "SELECT MAX(updated_at) FROM orders"
        }))
        .unwrap();
        assert_eq!(
            spec,
            RefreshKeySpec::sql("SELECT MAX(updated_at) FROM orders", vec![])
        );

        let every = serde_json::to_value(RefreshKeySpec::every(Duration::from_secs(60))).unwrap();
        assert_eq!(every, json!({"type": "every", "every_secs": 60}));
    }

    #[test]
    fn test_policy_defaults() {
        let policy: CachePolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy, CachePolicy::default());
        assert!(policy.wait_for_renew);
        assert_eq!(policy.hard_expiration_secs, 86_400);
    }

    #[test]
    fn test_key_builders_only_touch_sql() {
        let spec = RefreshKeySpec::sql("SELECT 1", vec![])
            .key_every(Duration::from_secs(30))
            .on_data_source("events");
        assert_eq!(
            spec,
            RefreshKeySpec::Sql {
                sql: "SELECT 1".into(),
                params: vec![],
                data_source: Some("events".into()),
                every_secs: Some(30),
            }
        );
        assert_eq!(
            RefreshKeySpec::Immutable.key_every(Duration::from_secs(1)),
            RefreshKeySpec::Immutable
        );
    }
}
