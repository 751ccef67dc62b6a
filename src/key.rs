//! Remote store key layout.
//!
//! ```text
//! [prefix_]table[_suffix]_v_1_v_2…     single-row cache key / multi-row index key
//! <index key>_k_1:k_2…                  multi-row data key
//! <key>_lock_preLoads                   load lock
//! <key>_lock_save                       save lock
//! ```
//!
//! The condition value named by the hash tag field, if any, is wrapped in braces so that clustered stores route all
//! keys of one condition to the same slot.

use crate::config::CacheConfig;
use crate::value::FieldValue;

/// Hash holding the auto-increment counters, one field per table.
pub const INCREMENT_KEY: &str = "_mrcache_increment_";

pub const SINGLE_ROW_PREFIX: &str = "mrr";
pub const MULTI_ROW_PREFIX: &str = "mrrs";

#[derive(Debug, Clone)]
pub struct KeyBuilder {
    base:     String,
    hash_tag: Option<usize>,
}

impl KeyBuilder {
    pub fn new(config: &CacheConfig, default_prefix: &str) -> Self {
        let prefix = config.key_prefix().unwrap_or(default_prefix);
        let mut base = String::with_capacity(prefix.len() + config.table_base_name().len() + 8);
        if !prefix.is_empty() {
            base.push_str(prefix);
            base.push('_');
        }
        base.push_str(&config.table_name());
        if let Some(suffix) = config.key_suffix() {
            base.push('_');
            base.push_str(suffix);
        }

        let hash_tag = config
            .hash_tag_field()
            .and_then(|tag| config.cond_fields().iter().position(|f| f == tag));

        Self { base, hash_tag }
    }

    #[inline]
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn cache_key(&self, cond: &[FieldValue]) -> String {
        let mut key = self.base.clone();
        for (idx, value) in cond.iter().enumerate() {
            if Some(idx) == self.hash_tag {
                key.push_str(&format!("_{{{value}}}"));
            }
            else {
                key.push_str(&format!("_{value}"));
            }
        }
        key
    }
}

/// The id of a row within its multi-row family: key values joined with `:`.
pub fn key_values_str(values: &[FieldValue]) -> String {
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(":")
}

#[inline]
pub fn data_key(index_key: &str, id: &str) -> String {
    format!("{index_key}_{id}")
}

#[inline]
pub fn load_lock_key(key: &str) -> String {
    format!("{key}_lock_preLoads")
}

#[inline]
pub fn save_lock_key(key: &str) -> String {
    format!("{key}_lock_save")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    fn config() -> crate::config::CacheConfigBuilder {
        CacheConfig::builder()
            .table_base_name("test")
            .cond_fields(vec!["uid".into(), "type".into()])
    }

    #[test]
    fn single_row_key() {
        let keys = KeyBuilder::new(&config().build().unwrap(), SINGLE_ROW_PREFIX);
        assert_eq!(keys.cache_key(&values![123, 9]), "mrr_test_123_9");
    }

    #[test]
    fn hash_tag_on_second_field() {
        let cfg = config().hash_tag_field("type").key_suffix("x").build().unwrap();
        let keys = KeyBuilder::new(&cfg, MULTI_ROW_PREFIX);
        assert_eq!(keys.cache_key(&values![123, 9]), "mrrs_test_x_123_{9}");
    }

    #[test]
    fn sharded_and_prefixed() {
        let cfg = config()
            .shard_count(4)
            .shard_index(3)
            .key_prefix("app")
            .hash_tag_field("uid")
            .build()
            .unwrap();
        let keys = KeyBuilder::new(&cfg, SINGLE_ROW_PREFIX);
        assert_eq!(keys.cache_key(&values![1, "a"]), "app_test3_{1}_a");
    }

    #[test]
    fn derived_keys() {
        let index = "mrrs_t_{1}";
        assert_eq!(data_key(index, &key_values_str(&values![7, "b"])), "mrrs_t_{1}_7:b");
        assert_eq!(load_lock_key(index), "mrrs_t_{1}_lock_preLoads");
        assert_eq!(save_lock_key(index), "mrrs_t_{1}_lock_save");
    }
}
