//! The top-level tracker handle
//!
//! [`Tracker`] ties the components together behind one connection pool:
//! ingestion ([`EventStore`]), reads ([`QueryEngine`]), charts
//! ([`Aggregator`]), and metric discovery ([`MetricRegistry`]).
//! `connect` validates the configuration, checks the store answers, and
//! upgrades the store layout before handing the tracker out, so every
//! method on a connected tracker sees the current layout.

use crate::chart::{Aggregator, ChartOptions};
use crate::config::TrackerConfig;
use crate::connection::{HealthStatus, PoolMetricsSnapshot, RedisPool};
use crate::error::{Error, Result};
use crate::keys::KeySchema;
use crate::migrate::SchemaMigrator;
use crate::query::{CountOptions, QueryEngine, QueryOptions};
use crate::registry::MetricRegistry;
use crate::scripts::LuaScripts;
use crate::store::{EventStore, TrackOptions};
use crate::types::{ChartBucket, ContextPath, EventId, EventRecord, Handle};
use crate::util::sanitize_url;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A connected event tracker
///
/// Cheap to clone; clones share the pool and caches.
///
/// # Example
///
/// ```rust,no_run
/// use tally::{CountOptions, TrackOptions, Tracker, TrackerConfig};
///
/// # async fn demo() -> tally::Result<()> {
/// let tracker = Tracker::connect(TrackerConfig::default()).await?;
///
/// let id = tracker
///     .track("page_hits", TrackOptions::new().with_context("home"))
///     .await?;
/// println!("tracked event {}", id);
///
/// let total = tracker.count("page_hits", CountOptions::new()).await?;
/// println!("{} page hits so far", total);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Tracker {
    config: TrackerConfig,
    pool: Arc<RedisPool>,
    store: EventStore,
    registry: MetricRegistry,
    query: QueryEngine,
    aggregator: Aggregator,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Connect to the store and prepare it for use
    ///
    /// Validates the configuration, opens the pool, confirms the store
    /// answers, and runs any pending layout migration. Fails rather
    /// than hand out a tracker against an unreachable store or a store
    /// written by a newer library.
    pub async fn connect(config: TrackerConfig) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(RedisPool::new(config.redis_config()).await?);
        if pool.health_check().await == HealthStatus::Unhealthy {
            return Err(Error::ConnectionError(
                "Redis did not answer PING during connect".to_string(),
            ));
        }

        let keys = KeySchema::new(&config.namespace);
        let scripts = Arc::new(LuaScripts::new());
        let registry = MetricRegistry::new(Arc::clone(&pool), keys.clone());

        SchemaMigrator::new(
            Arc::clone(&pool),
            keys.clone(),
            Arc::clone(&scripts),
            registry.clone(),
        )
        .check_schema()
        .await?;

        let store = EventStore::new(
            Arc::clone(&pool),
            keys.clone(),
            Arc::clone(&scripts),
            config.default_edit_window(),
        );
        let query = QueryEngine::new(Arc::clone(&pool), keys, registry.clone());
        let aggregator = Aggregator::new(query.clone());

        info!(
            "Tracker connected to {} under namespace '{}'",
            sanitize_url(&config.redis.url),
            config.namespace
        );

        Ok(Self {
            config,
            pool,
            store,
            registry,
            query,
            aggregator,
        })
    }

    // ===== Ingestion =====

    /// Record one occurrence of a metric and return its event id
    pub async fn track(&self, metric: &str, opts: TrackOptions) -> Result<EventId> {
        self.store.track(metric, opts).await
    }

    /// Merge metadata fields into an existing event, by id or alias
    pub async fn update(
        &self,
        handle: impl Into<Handle>,
        meta: HashMap<String, String>,
    ) -> Result<()> {
        self.store.update(handle, meta).await
    }

    // ===== Queries =====

    /// Fetch event records for a metric
    pub async fn query(&self, metric: &str, opts: QueryOptions) -> Result<Vec<EventRecord>> {
        self.query.query(metric, opts).await
    }

    /// Count events for a metric
    pub async fn count(&self, metric: &str, opts: CountOptions) -> Result<u64> {
        self.query.count(metric, opts).await
    }

    /// Tally a metadata field's values across the selected events
    pub async fn count_by(
        &self,
        metric: &str,
        field: &str,
        opts: CountOptions,
    ) -> Result<HashMap<String, u64>> {
        self.query.count_by(metric, field, opts).await
    }

    // ===== Charts =====

    /// Count events per time bucket
    pub async fn chart(&self, metric: &str, opts: ChartOptions) -> Result<Vec<ChartBucket>> {
        self.aggregator.chart(metric, opts).await
    }

    // ===== Discovery =====

    /// Every registered metric name, sorted
    pub async fn metrics(&self) -> Result<Vec<String>> {
        self.registry.metrics().await
    }

    /// True if the metric has been tracked at least once
    pub async fn is_valid_metric(&self, metric: &str) -> Result<bool> {
        self.registry.is_valid_metric(metric).await
    }

    /// Field names ever written under the metric and context, sorted
    pub async fn fields_for(
        &self,
        metric: &str,
        context: impl Into<ContextPath>,
    ) -> Result<Vec<String>> {
        self.registry.fields_for(metric, &context.into()).await
    }

    // ===== Operations =====

    /// Ping the store and report pool health
    pub async fn health_check(&self) -> HealthStatus {
        self.pool.health_check().await
    }

    /// Snapshot of pool counters: commands, failures, retries, latency
    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics()
    }

    /// The configuration this tracker was built from
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ===== Components =====

    /// Direct access to the write path
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Direct access to the metric registry
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Direct access to the read path
    pub fn query_engine(&self) -> &QueryEngine {
        &self.query
    }

    /// Direct access to the chart aggregator
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }
}
