use std::sync::LazyLock;
use std::time::Duration;
use std::time::Instant;

use moka::sync::Cache;
use moka::Expiry;

const DEFAULT_CAPACITY: u64 = 1_000_000;

static SHARED: LazyLock<NegativeCache> = LazyLock::new(|| NegativeCache::new(DEFAULT_CAPACITY));

#[derive(Debug, Clone, Copy)]
struct Marker {
    ttl: Duration,
}

struct MarkerExpiry;

impl Expiry<String, Marker> for MarkerExpiry {
    fn expire_after_create(&self, _key: &String, marker: &Marker, _created_at: Instant) -> Option<Duration> {
        Some(marker.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        marker: &Marker,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(marker.ttl)
    }
}

/// Process-local registry of cache keys for which the SQL store recently returned no rows.
///
/// Markers are hints: they may vanish at any time (TTL, capacity eviction) but are removed explicitly whenever a row is
/// inserted under their key. The registry is cheap to clone; clones share the same storage.
#[derive(Clone)]
pub struct NegativeCache {
    markers: Cache<String, Marker>,
}

impl NegativeCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            markers: Cache::builder()
                .max_capacity(capacity)
                .expire_after(MarkerExpiry)
                .build(),
        }
    }

    /// The registry shared by every cache built without an explicit one.
    pub fn shared() -> Self {
        SHARED.clone()
    }

    pub fn mark(&self, key: &str, ttl: Duration) {
        self.markers.insert(key.to_string(), Marker { ttl });
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.markers.contains_key(key)
    }

    pub fn clear(&self, key: &str) {
        self.markers.invalidate(key);
    }
}

impl std::fmt::Debug for NegativeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegativeCache")
            .field("entries", &self.markers.entry_count())
            .finish()
    }
}
