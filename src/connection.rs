//! Redis connection pool with retry logic and health checking
//!
//! Every store access in this crate goes through [`RedisPool::execute`],
//! which bounds concurrency with a semaphore, applies the configured
//! command timeout, and retries transient failures with exponential
//! backoff. Domain-level failures (unknown metric, bad reference, bad
//! chart options) never reach this layer; only transport errors are
//! retried here.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally::connection::{RedisConfig, RedisPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::new(RedisConfig::with_url("redis://localhost:6379")).await?;
//! let pong: String = pool
//!     .execute(|mut conn| async move {
//!         redis::cmd("PING").query_async::<String>(&mut conn).await
//!     })
//!     .await?;
//! assert_eq!(pong, "PONG");
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::util::safe_redis_error;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Configuration for the Redis connection pool
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of concurrent commands in flight
    /// Default: 16
    pub pool_size: u32,

    /// Timeout for establishing new connections
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Timeout for individual Redis commands
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Retry policy for failed operations
    pub retry_policy: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RedisConfig {
    /// Create a new config with the specified URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err("Redis URL must use the redis:// or rediss:// scheme".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("Pool size cannot exceed 1000".to_string());
        }
        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    /// Default: 3
    pub max_retries: u32,

    /// Initial delay between retries
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Maximum delay between retries
    /// Default: 5 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add random jitter to delays
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            delay_ms * (1.0 + jitter)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if we should retry after the given attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Connection pool metrics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total number of successful connections
    pub connections_created: AtomicU64,

    /// Total number of connection failures
    pub connection_failures: AtomicU64,

    /// Total number of commands executed
    pub commands_executed: AtomicU64,

    /// Total number of command failures
    pub command_failures: AtomicU64,

    /// Total number of retries
    pub retries: AtomicU64,

    /// Total command latency in microseconds
    pub total_latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_connection(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average command latency in microseconds
    pub fn average_latency_us(&self) -> f64 {
        let total = self.total_latency_us.load(Ordering::Relaxed);
        let count = self.commands_executed.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Get a snapshot of the metrics
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
        }
    }
}

/// Snapshot of pool metrics at a point in time
#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    /// Total number of connections created during pool lifetime
    pub connections_created: u64,
    /// Total number of connection failures during pool lifetime
    pub connection_failures: u64,
    /// Total number of commands executed through the pool
    pub commands_executed: u64,
    /// Total number of command failures encountered
    pub command_failures: u64,
    /// Total number of retry attempts made for failed operations
    pub retries: u64,
    /// Average command latency in microseconds
    pub average_latency_us: f64,
}

/// Health status of the Redis connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connection is healthy
    Healthy,
    /// Connection is degraded (slow but working)
    Degraded,
    /// Connection is unhealthy
    Unhealthy,
    /// Health status unknown (not yet checked)
    Unknown,
}

/// Redis connection pool
///
/// Holds one multiplexed connection (the redis crate multiplexes
/// concurrent commands over it) plus a semaphore that bounds in-flight
/// operations to the configured pool size.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// The multiplexed connection, replaced on reconnect
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Pool configuration
    config: RedisConfig,

    /// Connection metrics
    metrics: Arc<PoolMetrics>,

    /// Semaphore to limit concurrent operations
    semaphore: Arc<Semaphore>,

    /// Current health status
    health_status: RwLock<HealthStatus>,
}

impl RedisPool {
    /// Create a new Redis connection pool and establish the initial
    /// connection
    pub async fn new(config: RedisConfig) -> Result<Self> {
        config.validate().map_err(Error::ConfigurationError)?;

        // Sanitized URL in error messages so credentials never leak
        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::ConnectionError(safe_redis_error(&config.url, &e)))?;

        let metrics = Arc::new(PoolMetrics::default());
        let semaphore = Arc::new(Semaphore::new(config.pool_size as usize));

        let pool = Self {
            client,
            connection: RwLock::new(None),
            config,
            metrics,
            semaphore,
            health_status: RwLock::new(HealthStatus::Unknown),
        };

        pool.connect().await?;

        debug!("Redis connection pool initialized");
        Ok(pool)
    }

    /// Establish or re-establish the connection
    async fn connect(&self) -> Result<()> {
        let start = Instant::now();

        let conn_future = self.client.get_multiplexed_async_connection();
        let conn = tokio::time::timeout(self.config.connection_timeout, conn_future)
            .await
            .map_err(|_| {
                self.metrics.record_connection_failure();
                Error::ConnectionError("Connection timeout".to_string())
            })?
            .map_err(|e| {
                self.metrics.record_connection_failure();
                Error::ConnectionError(safe_redis_error(&self.config.url, &e))
            })?;

        {
            let mut guard = self.connection.write().await;
            *guard = Some(conn);
        }

        self.metrics.record_connection();
        *self.health_status.write().await = HealthStatus::Healthy;

        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(())
    }

    /// Get a connection from the pool
    ///
    /// Acquires a semaphore permit; the permit is released when the
    /// returned guard is dropped.
    pub async fn get(&self) -> Result<PooledConnection<'_>> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionError("Semaphore closed".to_string()))?;

        let conn = {
            let guard = self.connection.read().await;
            guard.clone()
        };

        let conn = match conn {
            Some(c) => c,
            None => {
                self.connect().await?;
                let guard = self.connection.read().await;
                guard
                    .clone()
                    .ok_or_else(|| Error::ConnectionError("No connection available".to_string()))?
            },
        };

        Ok(PooledConnection {
            conn,
            _permit: permit,
            _marker: std::marker::PhantomData,
        })
    }

    /// Execute a command with timeout and retry
    ///
    /// `f` is called with a clone of the multiplexed connection and may
    /// be called again on transient failure, so callers clone captured
    /// values inside the closure body.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, RedisError>>,
    {
        let mut attempt = 0;

        loop {
            let conn = self.get().await?;
            let start = Instant::now();

            let result =
                tokio::time::timeout(self.config.command_timeout, f(conn.conn.clone())).await;

            match result {
                Ok(Ok(value)) => {
                    self.metrics.record_command(start.elapsed());
                    return Ok(value);
                },
                Ok(Err(e)) => {
                    self.metrics.record_command_failure();

                    if self.config.retry_policy.should_retry(attempt) && is_retryable_error(&e) {
                        self.metrics.record_retry();
                        let delay = self.config.retry_policy.delay_for_attempt(attempt);
                        warn!(
                            "Redis command failed (attempt {}), retrying in {:?}: {}",
                            attempt + 1,
                            delay,
                            safe_redis_error(&self.config.url, &e)
                        );
                        tokio::time::sleep(delay).await;

                        if is_connection_error(&e) {
                            let _ = self.connect().await;
                        }

                        attempt += 1;
                        continue;
                    }

                    return Err(Error::ConnectionError(safe_redis_error(
                        &self.config.url,
                        &e,
                    )));
                },
                Err(_) => {
                    self.metrics.record_command_failure();

                    if self.config.retry_policy.should_retry(attempt) {
                        self.metrics.record_retry();
                        let delay = self.config.retry_policy.delay_for_attempt(attempt);
                        warn!(
                            "Redis command timeout (attempt {}), retrying in {:?}",
                            attempt + 1,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(Error::ConnectionError("Command timeout".to_string()));
                },
            }
        }
    }

    /// Perform a health check
    ///
    /// Sends a PING and updates the cached health status.
    pub async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();

        let result = self
            .execute(
                |mut conn| async move { redis::cmd("PING").query_async::<String>(&mut conn).await },
            )
            .await;

        let status = match result {
            Ok(_) => {
                if start.elapsed() > Duration::from_millis(100) {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            },
            Err(_) => HealthStatus::Unhealthy,
        };

        *self.health_status.write().await = status.clone();
        status
    }

    /// Get the most recently observed health status without touching the
    /// server. Returns Unknown if the status lock is currently held.
    pub fn health_status(&self) -> HealthStatus {
        self.health_status
            .try_read()
            .map(|guard| guard.clone())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get the pool configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// A pooled connection that releases its permit when dropped
pub struct PooledConnection<'a> {
    conn: MultiplexedConnection,
    _permit: tokio::sync::OwnedSemaphorePermit,
    // guard lifetime stays tied to the pool
    _marker: std::marker::PhantomData<&'a RedisPool>,
}

impl<'a> std::ops::Deref for PooledConnection<'a> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<'a> std::ops::DerefMut for PooledConnection<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Check if an error is worth retrying
fn is_retryable_error(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(
            e.kind(),
            redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::TryAgain
                | redis::ErrorKind::ClusterDown
                | redis::ErrorKind::MasterDown
        )
}

/// Check if an error means the connection itself is gone
fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = RedisConfig {
            url: "".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "localhost:6379".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "redis://localhost".to_string(),
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "redis://localhost".to_string(),
            pool_size: 1001,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "redis://localhost".to_string(),
            pool_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));

        // Caps at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::default();

        metrics.record_connection();
        metrics.record_command(Duration::from_micros(100));
        metrics.record_command(Duration::from_micros(200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.commands_executed, 2);
        assert_eq!(snapshot.average_latency_us, 150.0);
    }

    #[test]
    fn test_config_builder() {
        let config = RedisConfig::with_url("redis://localhost:6380")
            .pool_size(32)
            .connection_timeout(Duration::from_secs(10));

        assert_eq!(config.url, "redis://localhost:6380");
        assert_eq!(config.pool_size, 32);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
    }
}
