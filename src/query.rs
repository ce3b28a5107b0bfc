//! Range queries, counts, and grouped counts over tracked events
//!
//! Reads resolve a metric (plus optional context) to one or more event
//! keys, fetch members in score order, and re-sort client-side: the
//! store breaks score ties lexicographically, which mis-orders numeric
//! ids (`:10:meta` sorts before `:9:meta`). Results from several keys
//! are concatenated in ascending key order, never globally merged.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::keys::{split_member, KeySchema};
use crate::registry::MetricRegistry;
use crate::types::{ContextPath, EventId, EventRecord, Handle, Timestamp};
use redis::AsyncCommands;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Commands batched per pipeline round trip on bulk fetches
const FETCH_BATCH: usize = 500;

/// Options for a `query` call
///
/// # Example
///
/// ```rust
/// use tally::QueryOptions;
///
/// let opts = QueryOptions::new()
///     .with_context("contact_us")
///     .with_fields(["browser"])
///     .with_time_start(1_700_000_000.0)
///     .with_time_end(1_700_003_600.0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Context path under the metric; the metric root when empty
    pub context: ContextPath,

    /// Look up one event by id instead of scanning a window
    pub id: Option<EventId>,

    /// Project metadata to these fields; full metadata when unset
    pub fields: Option<Vec<String>>,

    /// Window start (inclusive); applied only when both bounds are set
    pub time_start: Option<Timestamp>,

    /// Window end (inclusive); applied only when both bounds are set
    pub time_end: Option<Timestamp>,
}

impl QueryOptions {
    /// Empty options: root context, whole window, full metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Query under a context path instead of the metric root
    pub fn with_context(mut self, context: impl Into<ContextPath>) -> Self {
        self.context = context.into();
        self
    }

    /// Fetch one event by the id `track` returned
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Return only the named metadata fields; fields an event lacks are
    /// absent from its record, not defaulted
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to events at or after this time
    pub fn with_time_start(mut self, time_start: Timestamp) -> Self {
        self.time_start = Some(time_start);
        self
    }

    /// Restrict to events at or before this time
    pub fn with_time_end(mut self, time_end: Timestamp) -> Self {
        self.time_end = Some(time_end);
        self
    }
}

/// Options for a `count` or `count_by` call
#[derive(Clone, Debug, Default)]
pub struct CountOptions {
    /// Context path under the metric; the metric root when empty
    pub context: ContextPath,

    /// Window start (inclusive); applied only when both bounds are set
    pub time_start: Option<Timestamp>,

    /// Window end (inclusive); applied only when both bounds are set
    pub time_end: Option<Timestamp>,
}

impl CountOptions {
    /// Empty options: root context, whole window
    pub fn new() -> Self {
        Self::default()
    }

    /// Count under a context path instead of the metric root
    pub fn with_context(mut self, context: impl Into<ContextPath>) -> Self {
        self.context = context.into();
        self
    }

    /// Restrict to events at or after this time
    pub fn with_time_start(mut self, time_start: Timestamp) -> Self {
        self.time_start = Some(time_start);
        self
    }

    /// Restrict to events at or before this time
    pub fn with_time_end(mut self, time_end: Timestamp) -> Self {
        self.time_end = Some(time_end);
        self
    }
}

/// Read path: event queries and counts with context resolution
#[derive(Clone)]
pub struct QueryEngine {
    pool: Arc<RedisPool>,
    keys: KeySchema,
    registry: MetricRegistry,
}

impl QueryEngine {
    /// Create a query engine over the shared pool
    pub fn new(pool: Arc<RedisPool>, keys: KeySchema, registry: MetricRegistry) -> Self {
        Self {
            pool,
            keys,
            registry,
        }
    }

    /// Fetch event records for a metric
    ///
    /// With an id, resolves exactly that event (time bounds are
    /// ignored). Otherwise walks every key under the resolved prefix:
    /// records come back ascending by `(generated_at, id)` within each
    /// key, keys in ascending name order.
    pub async fn query(&self, metric: &str, opts: QueryOptions) -> Result<Vec<EventRecord>> {
        if let Some(id) = opts.id {
            return self.query_by_id(metric, id, opts.fields.as_deref()).await;
        }

        let keys = self.resolve_keys(metric, &opts.context).await?;
        let mut records = Vec::new();

        for key in &keys {
            let members = self
                .members_in_window(key, opts.time_start, opts.time_end)
                .await?;
            let rows = rows_in_order(key, members);

            let fetched = match opts.fields.as_deref() {
                Some(fields) => self.fetch_projected(&rows, fields).await?,
                None => self.fetch_full(&rows).await?,
            };
            records.extend(fetched);
        }

        Ok(records)
    }

    /// Count events for a metric, over the whole history or a window
    ///
    /// Both bounds set uses an inclusive range count; otherwise the
    /// full cardinality. Counts sum across every resolved key.
    pub async fn count(&self, metric: &str, opts: CountOptions) -> Result<u64> {
        let keys = self.resolve_keys(metric, &opts.context).await?;
        let mut total = 0u64;

        for key in &keys {
            let n: u64 = match (opts.time_start, opts.time_end) {
                (Some(start), Some(end)) => {
                    self.pool
                        .execute(|mut conn| {
                            let key = key.clone();
                            async move { conn.zcount(&key, start, end).await }
                        })
                        .await?
                },
                _ => {
                    self.pool
                        .execute(|mut conn| {
                            let key = key.clone();
                            async move { conn.zcard(&key).await }
                        })
                        .await?
                },
            };
            total += n;
        }

        Ok(total)
    }

    /// Tally a metadata field's values across the selected events
    ///
    /// Selection matches `query`; events lacking the field are skipped.
    pub async fn count_by(
        &self,
        metric: &str,
        field: &str,
        opts: CountOptions,
    ) -> Result<HashMap<String, u64>> {
        let keys = self.resolve_keys(metric, &opts.context).await?;
        let mut tallies: HashMap<String, u64> = HashMap::new();

        for key in &keys {
            let members = self
                .members_in_window(key, opts.time_start, opts.time_end)
                .await?;
            let rows = rows_in_order(key, members);

            for chunk in rows.chunks(FETCH_BATCH) {
                let values: Vec<Option<String>> = self
                    .pool
                    .execute(|mut conn| {
                        let members: Vec<String> =
                            chunk.iter().map(|row| row.member.clone()).collect();
                        let field = field.to_string();
                        async move {
                            let mut pipe = redis::pipe();
                            for member in &members {
                                pipe.hget(member, &field);
                            }
                            pipe.query_async(&mut conn).await
                        }
                    })
                    .await?;

                for value in values.into_iter().flatten() {
                    *tallies.entry(value).or_insert(0) += 1;
                }
            }
        }

        Ok(tallies)
    }

    /// Resolve a metric and context to its event keys, sorted
    ///
    /// Context segments only ever append to the metric prefix, so a
    /// nested context is unreachable except through its full parent
    /// path.
    pub(crate) async fn resolve_keys(
        &self,
        metric: &str,
        context: &ContextPath,
    ) -> Result<Vec<String>> {
        let key = self.registry.build_key(metric, true).await?;
        let prefix = format!("{}{}", key, KeySchema::context_suffix(context));
        self.keys.find_keys(&self.pool, &prefix).await
    }

    /// Count members per half-open window `[start, start + width)`
    /// across all keys
    pub(crate) async fn bucket_counts(
        &self,
        keys: &[String],
        starts: &[Timestamp],
        width: f64,
    ) -> Result<Vec<u64>> {
        let mut counts = vec![0u64; starts.len()];

        for key in keys {
            for (offset, chunk) in starts.chunks(FETCH_BATCH).enumerate() {
                let chunk_counts: Vec<u64> = self
                    .pool
                    .execute(|mut conn| {
                        let key = key.clone();
                        let chunk = chunk.to_vec();
                        async move {
                            let mut pipe = redis::pipe();
                            for start in &chunk {
                                pipe.zcount(&key, *start, exclusive_bound(start + width));
                            }
                            pipe.query_async(&mut conn).await
                        }
                    })
                    .await?;

                for (i, n) in chunk_counts.into_iter().enumerate() {
                    counts[offset * FETCH_BATCH + i] += n;
                }
            }
        }

        Ok(counts)
    }

    /// Earliest and latest event timestamps across the keys, if any
    /// member exists
    pub(crate) async fn score_extent(
        &self,
        keys: &[String],
    ) -> Result<Option<(Timestamp, Timestamp)>> {
        let mut extent: Option<(Timestamp, Timestamp)> = None;

        for key in keys {
            let (first, last): (Vec<(String, f64)>, Vec<(String, f64)>) = self
                .pool
                .execute(|mut conn| {
                    let key = key.clone();
                    async move {
                        let mut pipe = redis::pipe();
                        pipe.zrange_withscores(&key, 0, 0);
                        pipe.zrange_withscores(&key, -1, -1);
                        pipe.query_async(&mut conn).await
                    }
                })
                .await?;

            if let (Some((_, min)), Some((_, max))) = (first.first(), last.first()) {
                extent = match extent {
                    Some((lo, hi)) => Some((lo.min(*min), hi.max(*max))),
                    None => Some((*min, *max)),
                };
            }
        }

        Ok(extent)
    }

    async fn query_by_id(
        &self,
        metric: &str,
        id: EventId,
        fields: Option<&[String]>,
    ) -> Result<Vec<EventRecord>> {
        // The metric must exist even when the id pins the event
        self.registry.build_key(metric, true).await?;

        let pointer = self.keys.id_pointer(id);
        let member: Option<String> = self
            .pool
            .execute(|mut conn| {
                let pointer = pointer.clone();
                async move { conn.get(&pointer).await }
            })
            .await?;
        let member = member.ok_or_else(|| Error::InvalidReference(Handle::Id(id).to_string()))?;

        let parsed = split_member(&member)
            .map(|(event_key, parsed_id)| (event_key.to_string(), parsed_id));
        let (event_key, parsed_id) = parsed
            .ok_or_else(|| Error::ParseError(format!("malformed metadata handle: {}", member)))?;

        // The pointer can outlive its event; confirm the member is live
        let score: Option<f64> = self
            .pool
            .execute(|mut conn| {
                let event_key = event_key.clone();
                let member = member.clone();
                async move { conn.zscore(&event_key, &member).await }
            })
            .await?;
        let score = score.ok_or_else(|| Error::InvalidReference(Handle::Id(id).to_string()))?;

        let row = Row {
            id: parsed_id,
            score,
            member,
        };
        match fields {
            Some(fields) => self.fetch_projected(std::slice::from_ref(&row), fields).await,
            None => self.fetch_full(std::slice::from_ref(&row)).await,
        }
    }

    async fn members_in_window(
        &self,
        key: &str,
        time_start: Option<Timestamp>,
        time_end: Option<Timestamp>,
    ) -> Result<Vec<(String, f64)>> {
        let members: Vec<(String, f64)> = match (time_start, time_end) {
            (Some(start), Some(end)) => {
                self.pool
                    .execute(|mut conn| {
                        let key = key.to_string();
                        async move { conn.zrangebyscore_withscores(&key, start, end).await }
                    })
                    .await?
            },
            _ => {
                self.pool
                    .execute(|mut conn| {
                        let key = key.to_string();
                        async move { conn.zrange_withscores(&key, 0, -1).await }
                    })
                    .await?
            },
        };
        Ok(members)
    }

    async fn fetch_full(&self, rows: &[Row]) -> Result<Vec<EventRecord>> {
        let mut records = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(FETCH_BATCH) {
            let hashes: Vec<HashMap<String, String>> = self
                .pool
                .execute(|mut conn| {
                    let members: Vec<String> =
                        chunk.iter().map(|row| row.member.clone()).collect();
                    async move {
                        let mut pipe = redis::pipe();
                        for member in &members {
                            pipe.hgetall(member);
                        }
                        pipe.query_async(&mut conn).await
                    }
                })
                .await?;

            for (row, meta) in chunk.iter().zip(hashes) {
                records.push(EventRecord {
                    id: row.id,
                    generated_at: row.score,
                    meta,
                });
            }
        }

        Ok(records)
    }

    async fn fetch_projected(&self, rows: &[Row], fields: &[String]) -> Result<Vec<EventRecord>> {
        if fields.is_empty() {
            return Ok(rows
                .iter()
                .map(|row| EventRecord {
                    id: row.id,
                    generated_at: row.score,
                    meta: HashMap::new(),
                })
                .collect());
        }

        let mut records = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(FETCH_BATCH) {
            let values: Vec<Option<String>> = self
                .pool
                .execute(|mut conn| {
                    let members: Vec<String> =
                        chunk.iter().map(|row| row.member.clone()).collect();
                    let fields = fields.to_vec();
                    async move {
                        let mut pipe = redis::pipe();
                        for member in &members {
                            for field in &fields {
                                pipe.hget(member, field);
                            }
                        }
                        pipe.query_async(&mut conn).await
                    }
                })
                .await?;

            let mut values = values.into_iter();
            for row in chunk {
                let mut meta = HashMap::new();
                for field in fields {
                    if let Some(value) = values.next().flatten() {
                        meta.insert(field.clone(), value);
                    }
                }
                records.push(EventRecord {
                    id: row.id,
                    generated_at: row.score,
                    meta,
                });
            }
        }

        Ok(records)
    }
}

/// One parsed ordered-set member awaiting its metadata fetch
struct Row {
    id: EventId,
    score: Timestamp,
    member: String,
}

/// Parse raw members and order them ascending by `(score, id)`
fn rows_in_order(key: &str, members: Vec<(String, f64)>) -> Vec<Row> {
    let mut rows = Vec::with_capacity(members.len());

    for (member, score) in members {
        let parsed = split_member(&member).map(|(_, id)| id);
        match parsed {
            Some(id) => rows.push(Row { id, score, member }),
            None => {
                warn!("Skipping member with unrecognized shape in {}: {}", key, member);
            },
        }
    }

    rows.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    rows
}

/// Render an exclusive range bound the store understands
fn exclusive_bound(value: f64) -> String {
    format!("({}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Ordering Tests =====

    #[test]
    fn test_rows_sorted_by_score_then_id() {
        let members = vec![
            ("tally:hits:10:meta".to_string(), 200.0),
            ("tally:hits:9:meta".to_string(), 200.0),
            ("tally:hits:12:meta".to_string(), 100.0),
        ];

        let rows = rows_in_order("tally:hits", members);
        let ids: Vec<u64> = rows.iter().map(|row| row.id).collect();

        // Earlier score first; equal scores break ties by numeric id,
        // which the store's lexicographic member order would invert
        assert_eq!(ids, vec![12, 9, 10]);
    }

    #[test]
    fn test_rows_skip_unrecognized_members() {
        let members = vec![
            ("tally:hits:7:meta".to_string(), 100.0),
            ("tally:hits:1699999999.25:meta".to_string(), 100.5),
            ("garbage".to_string(), 101.0),
        ];

        let rows = rows_in_order("tally:hits", members);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 7);
    }

    // ===== Bound Rendering Tests =====

    #[test]
    fn test_exclusive_bound_format() {
        assert_eq!(exclusive_bound(100.0), "(100");
        assert_eq!(exclusive_bound(100.5), "(100.5");
    }

    // ===== Options Tests =====

    #[test]
    fn test_query_options_builder() {
        let opts = QueryOptions::new()
            .with_context(["user_123", "video_8172"])
            .with_fields(["browser", "version"])
            .with_time_start(100.0)
            .with_time_end(200.0);

        assert_eq!(opts.context.segments().len(), 2);
        assert_eq!(opts.fields.as_ref().map(Vec::len), Some(2));
        assert_eq!(opts.time_start, Some(100.0));
        assert_eq!(opts.time_end, Some(200.0));
        assert!(opts.id.is_none());
    }

    #[test]
    fn test_count_options_builder() {
        let opts = CountOptions::new()
            .with_context("contact_us")
            .with_time_start(100.0);

        assert_eq!(opts.context.segments(), ["contact_us"]);
        assert_eq!(opts.time_start, Some(100.0));
        assert!(opts.time_end.is_none());
    }
}
