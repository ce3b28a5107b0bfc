//! Registry of known metrics and their metadata field names
//!
//! A metric is valid once it has been tracked at least once. Membership
//! checks back every read-path validation, so positive answers are
//! cached in-process (metrics are never unregistered). Negative answers
//! are never cached: another process may register the metric at any
//! moment.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::keys::KeySchema;
use crate::types::ContextPath;
use redis::AsyncCommands;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tracks the set of registered metric names and per-key field names
#[derive(Clone)]
pub struct MetricRegistry {
    pool: Arc<RedisPool>,
    keys: KeySchema,
    known: Arc<RwLock<HashSet<String>>>,
}

impl MetricRegistry {
    /// Create a registry over the shared pool
    pub fn new(pool: Arc<RedisPool>, keys: KeySchema) -> Self {
        Self {
            pool,
            keys,
            known: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// True if the metric has been tracked at least once
    pub async fn is_valid_metric(&self, metric: &str) -> Result<bool> {
        let name = KeySchema::normalize(metric);

        if self.known.read().await.contains(&name) {
            return Ok(true);
        }

        let registry_key = self.keys.registry_key();
        let registered: bool = self
            .pool
            .execute(|mut conn| {
                let registry_key = registry_key.clone();
                let name = name.clone();
                async move { conn.sismember(&registry_key, &name).await }
            })
            .await?;

        if registered {
            self.known.write().await.insert(name);
        }
        Ok(registered)
    }

    /// Canonical key for a metric, optionally validating that the metric
    /// is registered
    ///
    /// Every read path validates; only the bootstrap write from `track`
    /// is exempt, since it registers the metric itself.
    pub async fn build_key(&self, metric: &str, validate: bool) -> Result<String> {
        if validate && !self.is_valid_metric(metric).await? {
            return Err(Error::UnknownMetric(KeySchema::normalize(metric)));
        }
        Ok(self.keys.metric_key(metric))
    }

    /// Every registered metric name, sorted
    pub async fn metrics(&self) -> Result<Vec<String>> {
        let registry_key = self.keys.registry_key();
        let mut names: Vec<String> = self
            .pool
            .execute(|mut conn| {
                let registry_key = registry_key.clone();
                async move { conn.smembers(&registry_key).await }
            })
            .await?;
        names.sort();
        Ok(names)
    }

    /// Union of field names ever written under the metric and context,
    /// across every nested key, sorted
    pub async fn fields_for(&self, metric: &str, context: &ContextPath) -> Result<Vec<String>> {
        let key = self.build_key(metric, true).await?;
        let prefix = format!("{}{}", key, KeySchema::context_suffix(context));
        let event_keys = self.keys.find_keys(&self.pool, &prefix).await?;

        let mut fields = BTreeSet::new();
        for event_key in &event_keys {
            let names: Vec<String> = self
                .pool
                .execute(|mut conn| {
                    let fields_key = KeySchema::fields_key(event_key);
                    async move { conn.smembers(&fields_key).await }
                })
                .await?;
            fields.extend(names);
        }

        Ok(fields.into_iter().collect())
    }

    /// Register a metric name directly; used when rebuilding the
    /// registry during migration (`track` registers atomically in its
    /// own script)
    pub(crate) async fn register(&self, normalized: &str) -> Result<()> {
        let registry_key = self.keys.registry_key();
        let _: () = self
            .pool
            .execute(|mut conn| {
                let registry_key = registry_key.clone();
                let name = normalized.to_string();
                async move { conn.sadd(&registry_key, &name).await }
            })
            .await?;

        self.known.write().await.insert(normalized.to_string());
        Ok(())
    }
}
