//! Key schema: name normalization, canonical key assembly, key discovery
//!
//! Every key this crate writes lives under a configurable namespace:
//!
//! ```text
//! <ns>:<metric>[:<context>...]   zset    event refs, scored by generated-at
//! <key>:<id>:meta                hash    metadata field -> value
//! <key>:fields                   set     field names ever written under <key>
//! <ns>:metrics                   set     registered metric names
//! <ns>:id:<id>                   string  points at <key>:<id>:meta
//! <ns>:ref:<alias>               string  points at <key>:<id>:meta, optional TTL
//! <ns>:version                   string  storage layout version tag
//! <ns>:idseq                     string  atomic id counter
//! ```
//!
//! Only event keys are ordered sets, so key discovery filters on value
//! type and never needs a name denylist to keep sidecars out.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::types::{ContextPath, EventId};

/// Per-iteration batch hint for SCAN
const SCAN_COUNT: usize = 100;

/// Metric names that would collide with bookkeeping keys directly under
/// the namespace
pub(crate) const RESERVED_METRICS: [&str; 3] = ["metrics", "version", "idseq"];

/// Builds and parses every key in the storage layout
///
/// Construction is pure string work; only [`KeySchema::find_keys`]
/// touches the store.
#[derive(Clone, Debug)]
pub struct KeySchema {
    namespace: String,
}

impl KeySchema {
    /// Create a schema rooted at the given namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The configured namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Normalize a metric or context name: lowercase, keep only
    /// `[a-z0-9 ]`, trim surrounding whitespace.
    ///
    /// Distinct inputs that normalize equal refer to the same key by
    /// design (`"Page-Views"` and `"page views "` collapse to
    /// `"pageviews"` and `"page views"` respectively).
    pub fn normalize(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ')
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Canonical key for a metric: `<ns>:<normalized-metric>`
    pub fn metric_key(&self, metric: &str) -> String {
        format!("{}:{}", self.namespace, Self::normalize(metric))
    }

    /// Context suffix `:<seg1>:<seg2>...` with each segment normalized
    ///
    /// An empty path, or a path whose segments all normalize to nothing,
    /// yields no suffix.
    pub fn context_suffix(context: &ContextPath) -> String {
        context
            .segments()
            .iter()
            .filter_map(|segment| {
                let normalized = Self::normalize(segment);
                if normalized.is_empty() {
                    None
                } else {
                    Some(format!(":{}", normalized))
                }
            })
            .collect()
    }

    /// Full event key for a metric under a context path
    pub fn event_key(&self, metric: &str, context: &ContextPath) -> String {
        format!("{}{}", self.metric_key(metric), Self::context_suffix(context))
    }

    /// Metadata hash key for one event: `<key>:<id>:meta`
    ///
    /// This string is also the member stored in the event key's ordered
    /// set, and the value every id/alias pointer holds.
    pub fn meta_key(event_key: &str, id: EventId) -> String {
        format!("{}:{}:meta", event_key, id)
    }

    /// Field-name set for an event key: `<key>:fields`
    pub fn fields_key(event_key: &str) -> String {
        format!("{}:fields", event_key)
    }

    /// Pointer key for an event id: `<ns>:id:<id>`
    pub fn id_pointer(&self, id: EventId) -> String {
        format!("{}:id:{}", self.namespace, id)
    }

    /// Prefix shared by all id pointers, for key construction inside
    /// scripts
    pub fn id_pointer_prefix(&self) -> String {
        format!("{}:id:", self.namespace)
    }

    /// Pointer key for a caller-supplied alias: `<ns>:ref:<alias>`
    ///
    /// The alias is stored verbatim; it is only ever used as an exact
    /// key, never in a scan pattern.
    pub fn ref_pointer(&self, alias: &str) -> String {
        format!("{}:ref:{}", self.namespace, alias)
    }

    /// The registered-metrics set: `<ns>:metrics`
    pub fn registry_key(&self) -> String {
        format!("{}:metrics", self.namespace)
    }

    /// The layout version tag: `<ns>:version`
    pub fn version_key(&self) -> String {
        format!("{}:version", self.namespace)
    }

    /// The id counter: `<ns>:idseq`
    pub fn idseq_key(&self) -> String {
        format!("{}:idseq", self.namespace)
    }

    /// Extract the metric name from an event key
    pub(crate) fn metric_of(&self, key: &str) -> Result<String> {
        let rest = key
            .strip_prefix(&self.namespace)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| {
                Error::ParseError(format!(
                    "key {:?} is outside namespace {:?}",
                    key, self.namespace
                ))
            })?;
        Ok(rest.split(':').next().unwrap_or_default().to_string())
    }

    /// Every live event key equal to `prefix` or nested under it, at any
    /// depth, sorted lexicographically.
    ///
    /// The scan pattern is anchored on the segment separator, so a
    /// prefix of `users` never matches `users2`. Sidecar keys (hashes,
    /// field sets, pointers, registry, version, idseq) are excluded by
    /// value type: only event keys are ordered sets.
    pub async fn find_keys(&self, pool: &RedisPool, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self.scan_zsets(pool, &format!("{}:*", prefix)).await?;

        // The prefix itself is an event key when events were tracked
        // directly at that level
        let kind: String = pool
            .execute(|mut conn| {
                let key = prefix.to_string();
                async move { redis::cmd("TYPE").arg(&key).query_async(&mut conn).await }
            })
            .await?;
        if kind == "zset" {
            keys.push(prefix.to_string());
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Collect every ordered-set key matching `pattern`
    ///
    /// SCAN may return duplicates across iterations, so the result is
    /// sorted and deduplicated.
    pub(crate) async fn scan_zsets(&self, pool: &RedisPool, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = pool
                .execute(|mut conn| {
                    let pattern = pattern.to_string();
                    async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(&pattern)
                            .arg("COUNT")
                            .arg(SCAN_COUNT)
                            .arg("TYPE")
                            .arg("zset")
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Reject metric names that vanish under normalization or collide with
/// bookkeeping keys
pub(crate) fn validate_metric_name(normalized: &str) -> Result<()> {
    if normalized.is_empty() {
        return Err(Error::ConfigurationError(
            "Metric name normalizes to an empty string".to_string(),
        ));
    }
    if RESERVED_METRICS.contains(&normalized) {
        return Err(Error::ConfigurationError(format!(
            "Metric name {:?} is reserved",
            normalized
        )));
    }
    Ok(())
}

/// Split an ordered-set member `<key>:<id>:meta` into its event key and
/// id. Returns `None` for anything not in that shape.
pub(crate) fn split_member(member: &str) -> Option<(&str, EventId)> {
    let stem = member.strip_suffix(":meta")?;
    let (key, id) = stem.rsplit_once(':')?;
    let id: EventId = id.parse().ok()?;
    Some((key, id))
}

/// Shape of one ordered-set member relative to the key that holds it
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MemberShape {
    /// `<key>:<integer-id>:meta`, the current layout
    Current(EventId),
    /// `<key>:<float-timestamp>:meta`, the pre-id layout
    Legacy,
    /// Anything else; written by some other tool
    Foreign,
}

/// Classify a member against the event key it was read from
pub(crate) fn classify_member(key: &str, member: &str) -> MemberShape {
    let middle = member
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|rest| rest.strip_suffix(":meta"));

    let middle = match middle {
        Some(middle) => middle,
        None => return MemberShape::Foreign,
    };

    if let Ok(id) = middle.parse::<EventId>() {
        MemberShape::Current(id)
    } else if middle.parse::<f64>().is_ok() {
        MemberShape::Legacy
    } else {
        MemberShape::Foreign
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> KeySchema {
        KeySchema::new("tally")
    }

    // ===== Normalization Tests =====

    #[test]
    fn test_normalize_lowercases_and_strips() {
        assert_eq!(KeySchema::normalize("Page-Views!"), "pageviews");
        assert_eq!(KeySchema::normalize("downloads"), "downloads");
        assert_eq!(KeySchema::normalize("user_123"), "user123");
        assert_eq!(KeySchema::normalize("  spaced out  "), "spaced out");
        assert_eq!(KeySchema::normalize("V2 API"), "v2 api");
    }

    #[test]
    fn test_normalize_strips_separators() {
        // Colons are the key separator and must never survive a segment
        assert_eq!(KeySchema::normalize("a:b:c"), "abc");
        assert_eq!(KeySchema::normalize("glob*chars?[ok]"), "globcharsok");
    }

    #[test]
    fn test_normalize_can_yield_empty() {
        assert_eq!(KeySchema::normalize("!!!"), "");
        assert_eq!(KeySchema::normalize("   "), "");
    }

    // ===== Key Assembly Tests =====

    #[test]
    fn test_metric_key() {
        assert_eq!(schema().metric_key("Page Views"), "tally:page views");
        assert_eq!(schema().metric_key("downloads"), "tally:downloads");
    }

    #[test]
    fn test_context_suffix() {
        assert_eq!(KeySchema::context_suffix(&ContextPath::root()), "");
        assert_eq!(KeySchema::context_suffix(&"home".into()), ":home");
        assert_eq!(
            KeySchema::context_suffix(&["user_123", "video_8172"].into()),
            ":user123:video8172"
        );
    }

    #[test]
    fn test_context_suffix_skips_empty_segments() {
        let path: ContextPath = ["home", "!!!", "about"].into();
        assert_eq!(KeySchema::context_suffix(&path), ":home:about");
    }

    #[test]
    fn test_event_key() {
        let schema = schema();
        assert_eq!(schema.event_key("views", &ContextPath::root()), "tally:views");
        assert_eq!(
            schema.event_key("views", &["home"].into()),
            "tally:views:home"
        );
    }

    #[test]
    fn test_sidecar_keys() {
        let schema = schema();
        assert_eq!(KeySchema::meta_key("tally:views:home", 7), "tally:views:home:7:meta");
        assert_eq!(KeySchema::fields_key("tally:views"), "tally:views:fields");
        assert_eq!(schema.id_pointer(42), "tally:id:42");
        assert_eq!(schema.id_pointer_prefix(), "tally:id:");
        assert_eq!(schema.ref_pointer("order-9000"), "tally:ref:order-9000");
        assert_eq!(schema.registry_key(), "tally:metrics");
        assert_eq!(schema.version_key(), "tally:version");
        assert_eq!(schema.idseq_key(), "tally:idseq");
    }

    #[test]
    fn test_metric_of() {
        let schema = schema();
        assert_eq!(schema.metric_of("tally:views").unwrap(), "views");
        assert_eq!(schema.metric_of("tally:views:home:deep").unwrap(), "views");
        assert!(schema.metric_of("other:views").is_err());
    }

    // ===== Metric Name Validation Tests =====

    #[test]
    fn test_validate_metric_name() {
        assert!(validate_metric_name("page views").is_ok());
        assert!(validate_metric_name("").is_err());
        assert!(validate_metric_name("metrics").is_err());
        assert!(validate_metric_name("version").is_err());
        assert!(validate_metric_name("idseq").is_err());
    }

    // ===== Member Parsing Tests =====

    #[test]
    fn test_split_member() {
        assert_eq!(
            split_member("tally:views:home:42:meta"),
            Some(("tally:views:home", 42))
        );
        assert_eq!(split_member("tally:views:7:meta"), Some(("tally:views", 7)));

        assert_eq!(split_member("tally:views:42"), None);
        assert_eq!(split_member("tally:views:abc:meta"), None);
        // Float middle segment is the legacy layout, not a valid id
        assert_eq!(split_member("tally:views:1316816268.91391:meta"), None);
    }

    #[test]
    fn test_classify_member() {
        let key = "tally:views:home";

        assert_eq!(
            classify_member(key, "tally:views:home:42:meta"),
            MemberShape::Current(42)
        );
        assert_eq!(
            classify_member(key, "tally:views:home:1316816268.91391:meta"),
            MemberShape::Legacy
        );

        // Wrong prefix, missing suffix, or nested garbage
        assert_eq!(
            classify_member(key, "tally:views:42:meta"),
            MemberShape::Foreign
        );
        assert_eq!(
            classify_member(key, "tally:views:home:42"),
            MemberShape::Foreign
        );
        assert_eq!(
            classify_member(key, "tally:views:home:a:9:meta"),
            MemberShape::Foreign
        );
    }

    #[test]
    fn test_classify_member_rejects_partial_prefix() {
        // "users2" is not nested under "users"
        assert_eq!(
            classify_member("tally:users", "tally:users2:7:meta"),
            MemberShape::Foreign
        );
    }
}
