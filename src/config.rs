use std::time::Duration;

use fieldx::fxstruct;

use crate::error::Error;
use crate::error::Result;
use crate::sql::Predicate;

/// Cached rows live for 36 hours since the last access unless configured otherwise.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(36 * 3600);

/// Per-instance cache settings.
///
/// ```ignore
/// let config = CacheConfig::builder()
///     .table_base_name("user_item")
///     .cond_fields(vec!["uid".into()])
///     .key_fields(vec!["type".into()])
///     .static_filter(vec![Predicate::ge("age", 20)])
///     .write_async(true)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[fxstruct(no_new, builder, get)]
pub struct CacheConfig {
    #[fieldx(builder(into))]
    table_base_name: String,

    /// Number of physical tables the base table is split into. `0` and `1` both mean unsharded.
    #[fieldx(get(copy), default(0))]
    shard_count: u32,

    /// Which physical table this instance serves.
    #[fieldx(get(copy), default(0))]
    shard_index: u32,

    cond_fields: Vec<String>,

    /// Only used by the multi-row cache.
    #[fieldx(default(Vec::new()))]
    key_fields: Vec<String>,

    #[fieldx(optional, get(off), builder(into))]
    hash_tag_field: String,

    /// Predicates AND-ed into every SELECT and DELETE, never into INSERT.
    #[fieldx(default(Vec::new()))]
    static_filter: Vec<Predicate>,

    #[fieldx(get(copy), default(DEFAULT_EXPIRE))]
    expire: Duration,

    #[fieldx(optional, get(off), builder(into))]
    key_prefix: String,

    #[fieldx(optional, get(off), builder(into))]
    key_suffix: String,

    /// Overrides the record's own auto-increment declaration.
    #[fieldx(optional, get(off), builder(into))]
    auto_incr_field: String,

    #[fieldx(get(copy), default(false))]
    write_async: bool,

    /// When off, load and save locks are no-ops and the caller guarantees mutual exclusion.
    #[fieldx(get(copy), default(true))]
    use_lock: bool,

    #[fieldx(get(copy), default(Duration::from_secs(600)))]
    negative_ttl: Duration,
}

impl CacheConfig {
    #[inline]
    pub fn hash_tag_field(&self) -> Option<&str> {
        self.hash_tag_field.as_deref()
    }

    #[inline]
    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    #[inline]
    pub fn key_suffix(&self) -> Option<&str> {
        self.key_suffix.as_deref()
    }

    #[inline]
    pub fn auto_incr_field(&self) -> Option<&str> {
        self.auto_incr_field.as_deref()
    }

    #[inline]
    pub fn is_sharded(&self) -> bool {
        self.shard_count > 1
    }

    /// Physical table name: the base name followed by the decimal shard index when sharded.
    pub fn table_name(&self) -> String {
        if self.is_sharded() {
            format!("{}{}", self.table_base_name, self.shard_index)
        }
        else {
            self.table_base_name.clone()
        }
    }

    /// Whole-seconds TTL as the remote store expects it; never zero.
    pub fn expire_secs(&self) -> u64 {
        self.expire.as_secs().max(1)
    }

    // Checks that don't need the table schema.
    pub(crate) fn validate(&self, multi_row: bool) -> Result<()> {
        if self.table_base_name.is_empty() {
            return Err(Error::config("table base name is empty"));
        }
        if self.cond_fields.is_empty() {
            return Err(Error::config("no condition fields"));
        }
        if self.is_sharded() && self.shard_index >= self.shard_count {
            return Err(Error::config(format!(
                "shard index {} is out of range for {} shards",
                self.shard_index, self.shard_count
            )));
        }
        if let Some(tag) = self.hash_tag_field() {
            if !self.cond_fields.iter().any(|f| f == tag) {
                return Err(Error::config(format!("hash tag field '{tag}' is not a condition field")));
            }
        }
        if multi_row {
            if self.key_fields.is_empty() {
                return Err(Error::config("no key fields"));
            }
            if let Some(dup) = self.key_fields.iter().find(|f| self.cond_fields.contains(f)) {
                return Err(Error::config(format!("'{dup}' is both a condition and a key field")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CacheConfigBuilder {
        CacheConfig::builder()
            .table_base_name("test")
            .cond_fields(vec!["uid".into(), "type".into()])
    }

    #[test]
    fn defaults() {
        let config = base().build().unwrap();
        assert_eq!(config.expire(), DEFAULT_EXPIRE);
        assert!(config.use_lock());
        assert!(!config.write_async());
        assert_eq!(config.table_name(), "test");
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn sharded_table_name() {
        let config = base().shard_count(4).shard_index(3).build().unwrap();
        assert_eq!(config.table_name(), "test3");

        let config = base().shard_count(4).shard_index(4).build().unwrap();
        assert!(matches!(config.validate(false), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn hash_tag_must_be_condition() {
        let config = base().hash_tag_field("name").build().unwrap();
        assert!(config.validate(false).is_err());
        let config = base().hash_tag_field("uid").build().unwrap();
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn multi_row_needs_keys() {
        let config = base().build().unwrap();
        assert!(config.validate(true).is_err());
        let config = base().key_fields(vec!["uid".into()]).build().unwrap();
        assert!(config.validate(true).is_err());
    }
}
