//! Server-side Lua scripts for atomic multi-key writes
//!
//! One `track` call touches up to six keys (event set, registry, id
//! counter, id pointer, alias pointer, metadata hash). Submitting those
//! writes as one script keeps them atomic: a concurrent reader observes
//! the whole event or none of it, and the id a call returns is the id
//! its writes used. Scripts are compiled lazily and cached by name; the
//! redis crate re-sends the source transparently if the server has
//! flushed its script cache.

use parking_lot::RwLock;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;

/// Atomically ingest one event.
///
/// # Keys
/// - KEYS[1]: event key (ordered set)
/// - KEYS[2]: registry set
/// - KEYS[3]: id counter
/// - KEYS[4]: field-name set for the event key
///
/// # Arguments
/// - ARGV[1]: score (generated-at, float epoch seconds)
/// - ARGV[2]: normalized metric name
/// - ARGV[3]: metadata as a JSON object, or '' when none
/// - ARGV[4]: alias pointer key, or '' when none
/// - ARGV[5]: alias TTL in milliseconds, 0 for no expiry
/// - ARGV[6]: id pointer key prefix
///
/// # Returns
/// The newly allocated event id.
const TRACK_EVENT: &str = r#"
local event_key = KEYS[1]
local registry_key = KEYS[2]
local idseq_key = KEYS[3]
local fields_key = KEYS[4]

local score = ARGV[1]
local metric = ARGV[2]
local meta_json = ARGV[3]
local ref_key = ARGV[4]
local ttl_ms = tonumber(ARGV[5])
local id_prefix = ARGV[6]

local id = redis.call('INCR', idseq_key)
local meta_key = event_key .. ':' .. id .. ':meta'

redis.call('SADD', registry_key, metric)
redis.call('ZADD', event_key, score, meta_key)
redis.call('SET', id_prefix .. id, meta_key)

if ref_key ~= '' then
    if ttl_ms > 0 then
        redis.call('SET', ref_key, meta_key, 'PX', ttl_ms)
    else
        redis.call('SET', ref_key, meta_key)
    end
end

if meta_json ~= '' then
    local meta = cjson.decode(meta_json)
    for field, value in pairs(meta) do
        redis.call('HSET', meta_key, field, value)
        redis.call('SADD', fields_key, field)
    end
end

return id
"#;

/// Merge metadata fields into the hash an id/alias pointer resolves to.
///
/// The pointer must resolve to a handle in the current layout whose
/// member is still live in its ordered set; stale pointers from older
/// layouts fail the shape check and report unresolved.
///
/// # Keys
/// - KEYS[1]: pointer key (id or alias)
///
/// # Arguments
/// - ARGV[1]: metadata to merge, as a JSON object
///
/// # Returns
/// 1 when the pointer resolved, 0 when it did not.
const UPDATE_META: &str = r#"
local meta_key = redis.call('GET', KEYS[1])
if not meta_key then
    return 0
end

local event_key = string.match(meta_key, '^(.+):%d+:meta$')
if not event_key then
    return 0
end
if not redis.call('ZSCORE', event_key, meta_key) then
    return 0
end

local fields_key = event_key .. ':fields'
local meta = cjson.decode(ARGV[1])
for field, value in pairs(meta) do
    redis.call('HSET', meta_key, field, value)
    redis.call('SADD', fields_key, field)
end

return 1
"#;

/// Rewrite one legacy timestamp-keyed member to the id-keyed layout.
///
/// Allocates a fresh id, swaps the ordered-set member keeping its score,
/// renames the metadata hash when one exists, writes the id pointer, and
/// backfills the field-name set.
///
/// # Keys
/// - KEYS[1]: event key (ordered set)
/// - KEYS[2]: id counter
///
/// # Arguments
/// - ARGV[1]: the legacy member string
/// - ARGV[2]: its score
/// - ARGV[3]: id pointer key prefix
///
/// # Returns
/// The new id, or 0 when the member was already gone (migrated by a
/// concurrent run).
const MIGRATE_MEMBER: &str = r#"
local event_key = KEYS[1]
local idseq_key = KEYS[2]

local old_member = ARGV[1]
local score = ARGV[2]
local id_prefix = ARGV[3]

if not redis.call('ZSCORE', event_key, old_member) then
    return 0
end

local id = redis.call('INCR', idseq_key)
local meta_key = event_key .. ':' .. id .. ':meta'

redis.call('ZREM', event_key, old_member)
redis.call('ZADD', event_key, score, meta_key)
redis.call('SET', id_prefix .. id, meta_key)

if redis.call('EXISTS', old_member) == 1 then
    redis.call('RENAME', old_member, meta_key)
    local fields_key = event_key .. ':fields'
    for _, field in ipairs(redis.call('HKEYS', meta_key)) do
        redis.call('SADD', fields_key, field)
    end
end

return id
"#;

/// Cache of compiled Lua scripts
///
/// Scripts are created on first use and shared as `Arc<Script>` after
/// that, so every invocation reuses the same SHA.
pub struct LuaScripts {
    scripts: RwLock<HashMap<&'static str, Arc<Script>>>,
}

impl LuaScripts {
    /// Create an empty script cache
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, name: &'static str, source: &str) -> Arc<Script> {
        {
            let cache = self.scripts.read();
            if let Some(script) = cache.get(name) {
                return Arc::clone(script);
            }
        }

        let script = Arc::new(Script::new(source));
        self.scripts.write().insert(name, Arc::clone(&script));
        script
    }

    /// The atomic ingestion script
    pub fn track_event(&self) -> Arc<Script> {
        self.get_or_create("track_event", TRACK_EVENT)
    }

    /// The metadata merge script
    pub fn update_meta(&self) -> Arc<Script> {
        self.get_or_create("update_meta", UPDATE_META)
    }

    /// The layout migration script
    pub fn migrate_member(&self) -> Arc<Script> {
        self.get_or_create("migrate_member", MIGRATE_MEMBER)
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_caching() {
        let scripts = LuaScripts::new();

        let first = scripts.track_event();
        let second = scripts.track_event();
        assert!(Arc::ptr_eq(&first, &second));

        // Different scripts get different entries
        let other = scripts.update_meta();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_all_scripts_have_hashes() {
        let scripts = LuaScripts::new();

        assert!(!scripts.track_event().get_hash().is_empty());
        assert!(!scripts.update_meta().get_hash().is_empty());
        assert!(!scripts.migrate_member().get_hash().is_empty());
    }
}
