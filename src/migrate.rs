//! Lazy store layout versioning and migration
//!
//! The store carries a version tag under `<ns>:version`. `check_schema`
//! compares it against the layout this library writes and upgrades the
//! store in place when it lags, one version boundary at a time. Every
//! step is idempotent, so a crash mid-migration is recovered by simply
//! running `check_schema` again. A store that is AHEAD of the library is
//! never touched.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::keys::{classify_member, KeySchema, MemberShape};
use crate::registry::MetricRegistry;
use crate::scripts::LuaScripts;
use redis::AsyncCommands;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The store layout version this library reads and writes
pub const SCHEMA_VERSION: u32 = 2;

/// How a stored version tag relates to the running layout version
#[derive(Debug, PartialEq)]
enum SchemaState {
    /// No tag: nothing has been written yet
    Fresh,
    /// Tag matches the running version
    Current,
    /// Tag is older; migration steps cover the gap
    Behind(u32),
    /// Tag is newer than this library understands
    Ahead(u32),
}

/// Checks the stored layout version and upgrades lagging stores
pub struct SchemaMigrator {
    pool: Arc<RedisPool>,
    keys: KeySchema,
    scripts: Arc<LuaScripts>,
    registry: MetricRegistry,
}

impl SchemaMigrator {
    /// Create a migrator over the shared pool
    pub fn new(
        pool: Arc<RedisPool>,
        keys: KeySchema,
        scripts: Arc<LuaScripts>,
        registry: MetricRegistry,
    ) -> Self {
        Self {
            pool,
            keys,
            scripts,
            registry,
        }
    }

    /// Bring the store layout up to [`SCHEMA_VERSION`]
    ///
    /// Fresh stores are stamped with the current version. Stores behind
    /// it run every migration step across the gap, in order, then the
    /// tag is updated. Stores ahead of it fail with
    /// [`Error::UpdateError`] without touching any data.
    pub async fn check_schema(&self) -> Result<()> {
        let version_key = self.keys.version_key();
        let stored: Option<String> = self
            .pool
            .execute(|mut conn| {
                let version_key = version_key.clone();
                async move { conn.get(&version_key).await }
            })
            .await?;

        match classify_version(stored.as_deref(), SCHEMA_VERSION)? {
            SchemaState::Current => {
                debug!("Store layout is current at v{}", SCHEMA_VERSION);
                Ok(())
            },
            SchemaState::Fresh => {
                self.write_version().await?;
                info!("Stamped fresh store with layout v{}", SCHEMA_VERSION);
                Ok(())
            },
            SchemaState::Ahead(found) => Err(Error::UpdateError(format!(
                "store layout is v{}, newer than the v{} this library writes",
                found, SCHEMA_VERSION
            ))),
            SchemaState::Behind(found) => {
                info!(
                    "Migrating store layout from v{} to v{}",
                    found, SCHEMA_VERSION
                );
                for from in found..SCHEMA_VERSION {
                    self.run_step(from).await.map_err(|e| {
                        Error::UpdateError(format!(
                            "migration step v{} -> v{} failed: {}",
                            from,
                            from + 1,
                            e
                        ))
                    })?;
                }
                self.write_version().await?;
                info!("Store layout migrated to v{}", SCHEMA_VERSION);
                Ok(())
            },
        }
    }

    async fn run_step(&self, from: u32) -> Result<()> {
        match from {
            1 => self.migrate_v1_to_v2().await,
            other => Err(Error::UpdateError(format!(
                "no migration step starts at v{}",
                other
            ))),
        }
    }

    /// v1 kept ordered-set members keyed by timestamp, with no event
    /// ids, no id pointers, no metric registry, and no field-name sets.
    /// Rewrite every legacy member to the id-keyed shape and rebuild
    /// the bookkeeping around it.
    async fn migrate_v1_to_v2(&self) -> Result<()> {
        let pattern = format!("{}:*", self.keys.namespace());
        let event_keys = self.keys.scan_zsets(&self.pool, &pattern).await?;
        let idseq_key = self.keys.idseq_key();
        let id_prefix = self.keys.id_pointer_prefix();
        let script = self.scripts.migrate_member();

        let mut migrated = 0u64;
        let mut skipped = 0u64;

        for key in &event_keys {
            let metric = self.keys.metric_of(key)?;
            self.registry.register(&metric).await?;

            let members: Vec<(String, f64)> = self
                .pool
                .execute(|mut conn| {
                    let key = key.clone();
                    async move { conn.zrange_withscores(&key, 0, -1).await }
                })
                .await?;

            for (member, score) in members {
                match classify_member(key, &member) {
                    MemberShape::Current(_) => {},
                    MemberShape::Legacy => {
                        let new_id: u64 = self
                            .pool
                            .execute(|mut conn| {
                                let script = script.clone();
                                let key = key.clone();
                                let idseq_key = idseq_key.clone();
                                let member = member.clone();
                                let score_arg = score.to_string();
                                let id_prefix = id_prefix.clone();
                                async move {
                                    script
                                        .key(key)
                                        .key(idseq_key)
                                        .arg(member)
                                        .arg(score_arg)
                                        .arg(id_prefix)
                                        .invoke_async(&mut conn)
                                        .await
                                }
                            })
                            .await?;
                        // 0 means a concurrent run already rewrote it
                        if new_id > 0 {
                            migrated += 1;
                        }
                    },
                    MemberShape::Foreign => {
                        warn!("Leaving unrecognized member untouched in {}: {}", key, member);
                        skipped += 1;
                    },
                }
            }
        }

        info!(
            "v1 -> v2: rewrote {} members across {} keys ({} left untouched)",
            migrated,
            event_keys.len(),
            skipped
        );
        Ok(())
    }

    async fn write_version(&self) -> Result<()> {
        let version_key = self.keys.version_key();
        let _: () = self
            .pool
            .execute(|mut conn| {
                let version_key = version_key.clone();
                async move { conn.set(&version_key, SCHEMA_VERSION.to_string()).await }
            })
            .await?;
        Ok(())
    }
}

/// Relate a stored version tag to the running layout version
fn classify_version(stored: Option<&str>, running: u32) -> Result<SchemaState> {
    let tag = match stored {
        Some(tag) => tag,
        None => return Ok(SchemaState::Fresh),
    };

    let found: u32 = tag
        .trim()
        .parse()
        .map_err(|_| Error::ParseError(format!("unrecognized schema version tag: {:?}", tag)))?;

    match found.cmp(&running) {
        Ordering::Equal => Ok(SchemaState::Current),
        Ordering::Less => Ok(SchemaState::Behind(found)),
        Ordering::Greater => Ok(SchemaState::Ahead(found)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Version Classification Tests =====

    #[test]
    fn test_absent_tag_is_fresh() {
        assert_eq!(classify_version(None, 2).unwrap(), SchemaState::Fresh);
    }

    #[test]
    fn test_matching_tag_is_current() {
        assert_eq!(classify_version(Some("2"), 2).unwrap(), SchemaState::Current);
    }

    #[test]
    fn test_older_tag_is_behind() {
        assert_eq!(
            classify_version(Some("1"), 2).unwrap(),
            SchemaState::Behind(1)
        );
    }

    #[test]
    fn test_newer_tag_is_ahead() {
        assert_eq!(
            classify_version(Some("3"), 2).unwrap(),
            SchemaState::Ahead(3)
        );
    }

    #[test]
    fn test_tag_whitespace_tolerated() {
        assert_eq!(
            classify_version(Some(" 2\n"), 2).unwrap(),
            SchemaState::Current
        );
    }

    #[test]
    fn test_garbage_tag_is_parse_error() {
        let err = classify_version(Some("bananas"), 2).unwrap_err();

        assert!(matches!(err, Error::ParseError(_)));
    }
}
