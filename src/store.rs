//! Event ingestion and metadata updates
//!
//! `track` is the only way an event enters the store. It runs as one
//! atomic script: allocate an id, register the metric, add the member to
//! the event set, write the pointer keys, and store any metadata. The id
//! it returns is the id those writes used, even under concurrent
//! trackers.
//!
//! `update` merges metadata fields into an existing event through either
//! handle kind. Timestamps and ids never change after `track`.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::keys::{validate_metric_name, KeySchema};
use crate::scripts::LuaScripts;
use crate::types::{now_timestamp, ContextPath, EventId, Handle, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Options for a single `track` call
///
/// # Example
///
/// ```rust
/// use tally::TrackOptions;
///
/// let opts = TrackOptions::new()
///     .with_context(["user_123", "video_8172"])
///     .with_meta("browser", "firefox")
///     .with_alias("page-hit-9000");
/// ```
#[derive(Clone, Debug, Default)]
pub struct TrackOptions {
    /// Context path under the metric; the metric root when empty
    pub context: ContextPath,

    /// Event time; the current time when unset
    pub generated_at: Option<Timestamp>,

    /// Initial metadata fields
    pub meta: HashMap<String, String>,

    /// Alias registered for later `update` calls
    pub alias: Option<String>,

    /// How long the alias stays resolvable; falls back to the store
    /// default when unset
    pub edit_window: Option<Duration>,
}

impl TrackOptions {
    /// Empty options: root context, current time, no metadata, no alias
    pub fn new() -> Self {
        Self::default()
    }

    /// Track under a context path instead of the metric root
    pub fn with_context(mut self, context: impl Into<ContextPath>) -> Self {
        self.context = context.into();
        self
    }

    /// Record the event at an explicit time instead of now
    pub fn with_generated_at(mut self, generated_at: Timestamp) -> Self {
        self.generated_at = Some(generated_at);
        self
    }

    /// Attach one metadata field; may be called repeatedly
    pub fn with_meta(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(field.into(), value.into());
        self
    }

    /// Register an alias so the event can be updated without its id
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Keep the alias resolvable for this long; a zero window means the
    /// alias never expires
    pub fn with_edit_window(mut self, window: Duration) -> Self {
        self.edit_window = Some(window);
        self
    }
}

/// Write path: atomic event ingestion and metadata merges
#[derive(Clone)]
pub struct EventStore {
    pool: Arc<RedisPool>,
    keys: KeySchema,
    scripts: Arc<LuaScripts>,
    default_edit_window: Option<Duration>,
}

impl EventStore {
    /// Create a store over the shared pool
    pub fn new(
        pool: Arc<RedisPool>,
        keys: KeySchema,
        scripts: Arc<LuaScripts>,
        default_edit_window: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            keys,
            scripts,
            default_edit_window,
        }
    }

    /// Record one occurrence of a metric and return its event id
    ///
    /// The metric is registered on first use; no setup call exists.
    /// Reserved bookkeeping names and names that normalize to nothing
    /// are rejected.
    pub async fn track(&self, metric: &str, opts: TrackOptions) -> Result<EventId> {
        let name = KeySchema::normalize(metric);
        validate_metric_name(&name)?;

        let event_key = self.keys.event_key(metric, &opts.context);
        let registry_key = self.keys.registry_key();
        let idseq_key = self.keys.idseq_key();
        let fields_key = KeySchema::fields_key(&event_key);
        let ref_key = match &opts.alias {
            Some(alias) => self.keys.ref_pointer(alias),
            None => String::new(),
        };
        let id_prefix = self.keys.id_pointer_prefix();

        let score = opts.generated_at.unwrap_or_else(now_timestamp);
        let score_arg = score.to_string();
        let meta_json = if opts.meta.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&opts.meta)?
        };
        let ttl_ms = effective_ttl_ms(opts.edit_window, self.default_edit_window);

        let script = self.scripts.track_event();
        let id: u64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let event_key = event_key.clone();
                let registry_key = registry_key.clone();
                let idseq_key = idseq_key.clone();
                let fields_key = fields_key.clone();
                let score_arg = score_arg.clone();
                let name = name.clone();
                let meta_json = meta_json.clone();
                let ref_key = ref_key.clone();
                let id_prefix = id_prefix.clone();
                async move {
                    script
                        .key(event_key)
                        .key(registry_key)
                        .key(idseq_key)
                        .key(fields_key)
                        .arg(score_arg)
                        .arg(name)
                        .arg(meta_json)
                        .arg(ref_key)
                        .arg(ttl_ms)
                        .arg(id_prefix)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        debug!("Tracked event {} for metric '{}' at {}", id, name, score);
        Ok(id)
    }

    /// Merge metadata fields into an existing event
    ///
    /// Accepts the event id from `track` or a registered alias. Fails
    /// with [`Error::InvalidReference`] when the handle does not resolve,
    /// including aliases whose edit window has lapsed.
    pub async fn update(
        &self,
        handle: impl Into<Handle>,
        meta: HashMap<String, String>,
    ) -> Result<()> {
        let handle = handle.into();
        let pointer = match &handle {
            Handle::Id(id) => self.keys.id_pointer(*id),
            Handle::Alias(alias) => self.keys.ref_pointer(alias),
        };
        let payload = serde_json::to_string(&meta)?;

        let script = self.scripts.update_meta();
        let resolved: i64 = self
            .pool
            .execute(|mut conn| {
                let script = script.clone();
                let pointer = pointer.clone();
                let payload = payload.clone();
                async move {
                    script
                        .key(pointer)
                        .arg(payload)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if resolved == 0 {
            return Err(Error::InvalidReference(handle.to_string()));
        }

        debug!("Merged {} metadata fields into {}", meta.len(), handle);
        Ok(())
    }
}

/// Alias TTL in milliseconds: the per-call window wins over the store
/// default, and zero disables expiry
fn effective_ttl_ms(requested: Option<Duration>, default: Option<Duration>) -> u64 {
    requested
        .or(default)
        .map(|window| window.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== TrackOptions Tests =====

    #[test]
    fn test_track_options_builder() {
        let opts = TrackOptions::new()
            .with_context(["user_123", "video_8172"])
            .with_generated_at(1_700_000_000.25)
            .with_meta("browser", "firefox")
            .with_meta("version", "121")
            .with_alias("page-hit-9000")
            .with_edit_window(Duration::from_secs(30));

        assert_eq!(opts.context.segments().len(), 2);
        assert_eq!(opts.generated_at, Some(1_700_000_000.25));
        assert_eq!(opts.meta.get("browser").map(String::as_str), Some("firefox"));
        assert_eq!(opts.meta.len(), 2);
        assert_eq!(opts.alias.as_deref(), Some("page-hit-9000"));
        assert_eq!(opts.edit_window, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_track_options_defaults() {
        let opts = TrackOptions::new();

        assert!(opts.context.is_root());
        assert!(opts.generated_at.is_none());
        assert!(opts.meta.is_empty());
        assert!(opts.alias.is_none());
        assert!(opts.edit_window.is_none());
    }

    // ===== Edit Window Tests =====

    #[test]
    fn test_effective_ttl_prefers_request_over_default() {
        let requested = Some(Duration::from_secs(30));
        let default = Some(Duration::from_secs(172_800));

        assert_eq!(effective_ttl_ms(requested, default), 30_000);
    }

    #[test]
    fn test_effective_ttl_falls_back_to_default() {
        let default = Some(Duration::from_millis(2_500));

        assert_eq!(effective_ttl_ms(None, default), 2_500);
        assert_eq!(effective_ttl_ms(None, None), 0);
    }

    #[test]
    fn test_effective_ttl_zero_request_disables_expiry() {
        let default = Some(Duration::from_secs(60));

        assert_eq!(effective_ttl_ms(Some(Duration::ZERO), default), 0);
    }
}
