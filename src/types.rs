//! Core data types used throughout the tracker
//!
//! # Key Types
//!
//! - **`EventId`**: Monotonically increasing identifier for a tracked event
//! - **`Timestamp`**: Event time as float epoch seconds (the sorted-set score)
//! - **`ContextPath`**: Ordered hierarchical context segments under a metric
//! - **`Handle`**: An event id or caller-supplied alias, for metadata updates
//! - **`EventRecord`**: One event as returned by queries
//! - **`ChartBucket`**: One half-open time window with its event count

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a tracked event
///
/// Allocated from an atomic counter in the store, so ids are strictly
/// increasing and never reused. They double as sort tie-breakers when two
/// events share a timestamp.
pub type EventId = u64;

/// Event time as epoch seconds with float precision
///
/// This is the score stored in the backing sorted set. Sub-second
/// precision is preserved.
pub type Timestamp = f64;

/// Current wall-clock time as a [`Timestamp`], with microsecond precision
pub fn now_timestamp() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Ordered context segments forming a nested namespace under a metric
///
/// An empty path means the metric's root. Each segment is normalized
/// before it reaches the store, and nesting is strict: a descendant is
/// only reachable through its full parent path.
///
/// # Example
///
/// ```rust
/// use tally::ContextPath;
///
/// let root = ContextPath::root();
/// assert!(root.is_root());
///
/// let single: ContextPath = "home".into();
/// assert_eq!(single.segments(), ["home"]);
///
/// let nested: ContextPath = ["user_123", "video_8172"].into();
/// assert_eq!(nested.segments().len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextPath(Vec<String>);

impl ContextPath {
    /// The empty path (metric root)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// The raw segments, in parent-to-child order
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True if this path has no segments
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ContextPath {
    fn from(segment: &str) -> Self {
        Self(vec![segment.to_string()])
    }
}

impl From<String> for ContextPath {
    fn from(segment: String) -> Self {
        Self(vec![segment])
    }
}

impl From<Vec<String>> for ContextPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for ContextPath {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ContextPath {
    fn from(segments: [&str; N]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}

/// A stable reference to an event's metadata, for `update`
///
/// Either the event id returned by `track`, or the alias string the
/// caller supplied at track time.
///
/// # Example
///
/// ```rust
/// use tally::Handle;
///
/// let by_id: Handle = 42u64.into();
/// let by_alias: Handle = "order-9000".into();
/// assert_ne!(by_id.to_string(), by_alias.to_string());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handle {
    /// Event id issued by `track`
    Id(EventId),
    /// Caller-supplied alias, possibly with an edit window
    Alias(String),
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Id(id) => write!(f, "id {}", id),
            Handle::Alias(alias) => write!(f, "alias {:?}", alias),
        }
    }
}

impl From<EventId> for Handle {
    fn from(id: EventId) -> Self {
        Handle::Id(id)
    }
}

impl From<&str> for Handle {
    fn from(alias: &str) -> Self {
        Handle::Alias(alias.to_string())
    }
}

impl From<String> for Handle {
    fn from(alias: String) -> Self {
        Handle::Alias(alias)
    }
}

/// One tracked event as returned by queries
///
/// Timestamp and id are immutable after `track`; only `meta` can change,
/// via `update`. Metadata values are stored and returned as strings, so
/// callers coerce numeric or boolean values themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event id issued at track time
    pub id: EventId,

    /// Generated-at time recovered from the stored score
    pub generated_at: Timestamp,

    /// Metadata mapping, possibly projected to the requested fields
    pub meta: HashMap<String, String>,
}

/// One chart bucket: the half-open window `[start, start + step)`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartBucket {
    /// Bucket start time (epoch seconds)
    pub start: Timestamp,

    /// Events counted inside the window
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_path_conversions() {
        assert!(ContextPath::root().is_root());
        assert!(!ContextPath::from("home").is_root());

        let from_str: ContextPath = "home".into();
        assert_eq!(from_str.segments(), ["home"]);

        let from_array: ContextPath = ["user_123", "video_8172"].into();
        assert_eq!(from_array.segments(), ["user_123", "video_8172"]);

        let from_vec: ContextPath = vec!["a".to_string(), "b".to_string()].into();
        assert_eq!(from_vec.segments(), ["a", "b"]);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::from(7u64).to_string(), "id 7");
        assert_eq!(Handle::from("invoice-1").to_string(), "alias \"invoice-1\"");
    }

    #[test]
    fn test_now_timestamp_is_recent_and_fractional() {
        let now = now_timestamp();
        // Sanity bound: after 2020-01-01 and before 2100-01-01
        assert!(now > 1_577_836_800.0);
        assert!(now < 4_102_444_800.0);
    }
}
