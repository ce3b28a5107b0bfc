//! Tally - Redis-backed discrete event tracking
//!
//! This library counts things. Each occurrence of a named metric becomes
//! an immutable event with an id, a timestamp, and optional string
//! metadata, and can be sliced afterwards:
//! - One atomic round trip per `track`, ids allocated server-side
//! - Hierarchical contexts under each metric (`page_hits` -> `home`)
//! - Range queries and counts with inclusive time windows
//! - Time-bucketed charts with fixed, derived, anchored, or
//!   auto-detected windows
//! - Metadata edits by event id or expiring alias
//! - Lazy, idempotent store layout migration on connect
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tally::{ChartOptions, TrackOptions, Tracker, TrackerConfig};
//!
//! # async fn demo() -> tally::Result<()> {
//! let tracker = Tracker::connect(TrackerConfig::default()).await?;
//!
//! tracker
//!     .track(
//!         "page_hits",
//!         TrackOptions::new()
//!             .with_context("home")
//!             .with_meta("browser", "firefox"),
//!     )
//!     .await?;
//!
//! let buckets = tracker
//!     .chart("page_hits", ChartOptions::new().with_data_points(24))
//!     .await?;
//! for bucket in buckets {
//!     println!("{}: {}", bucket.start, bucket.count);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Store layout
//!
//! Everything lives under one namespace (default `tally`):
//!
//! ```text
//! <ns>:<metric>[:<context>...]   ordered set of event handles, scored by time
//! <key>:<id>:meta                metadata hash for one event
//! <key>:fields                   field names ever written under the key
//! <ns>:metrics                   registered metric names
//! <ns>:id:<id>  /  <ns>:ref:<a>  pointers from id/alias to the metadata hash
//! <ns>:version  /  <ns>:idseq    layout version tag and id counter
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod types;

/// Atomic server-side scripts backing multi-key writes
pub mod scripts;

/// Metric registration and field-name discovery
pub mod registry;

/// Event ingestion and metadata updates
pub mod store;

/// Range queries, counts, and grouped counts
pub mod query;

/// Time-bucketed chart aggregation
pub mod chart;

/// Store layout versioning and migration
pub mod migrate;

/// The top-level tracker handle
pub mod tracker;

mod util;

// Re-export the main types
pub use chart::{Aggregator, ChartOptions};
pub use config::{RedisSettings, TrackerConfig};
pub use connection::{HealthStatus, PoolMetricsSnapshot, RedisConfig, RedisPool, RetryPolicy};
pub use error::{Error, Result};
pub use keys::KeySchema;
pub use migrate::{SchemaMigrator, SCHEMA_VERSION};
pub use query::{CountOptions, QueryEngine, QueryOptions};
pub use registry::MetricRegistry;
pub use scripts::LuaScripts;
pub use store::{EventStore, TrackOptions};
pub use tracker::Tracker;
pub use types::{
    now_timestamp, ChartBucket, ContextPath, EventId, EventRecord, Handle, Timestamp,
};

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_sanity() {
        assert_eq!(2 + 2, 4);
    }
}
