use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::{
    assembler::{FeatureTable, MissingValuePolicy},
    relations::{RelationKind, Relations},
};

/// Content hash of a set of input relations.
///
/// Row order inside a relation does not affect the fingerprint: each row is hashed on its
/// own and the digests are sorted before being folded into the final hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprints all five relations.
    #[must_use]
    pub fn of(relations: &Relations) -> Self {
        let mut hasher = blake3::Hasher::new();
        for kind in RelationKind::ALL {
            let mut digests = match kind {
                RelationKind::Orders => row_digests(&relations.orders),
                RelationKind::PriorOrderLines => row_digests(&relations.prior),
                RelationKind::Products => row_digests(&relations.products),
                RelationKind::Aisles => row_digests(&relations.aisles),
                RelationKind::Departments => row_digests(&relations.departments),
            };
            digests.sort_unstable();
            hasher.update(kind.name().as_bytes());
            hasher.update(&(digests.len() as u64).to_le_bytes());
            for digest in &digests {
                hasher.update(digest);
            }
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Key for a table assembled from these relations under `policy`.
    ///
    /// Tables built with different fill values differ, so the policy is part of the key.
    #[must_use]
    pub fn with_policy(&self, policy: MissingValuePolicy) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(b"avg_days_fill");
        hasher.update(&policy.avg_days_fill.to_bits().to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

fn row_digests<T: Serialize>(rows: &[T]) -> Vec<[u8; 32]> {
    rows.iter()
        .map(|row| {
            // Plain data rows; serialization cannot fail.
            let bytes = serde_json::to_vec(row).unwrap_or_default();
            *blake3::hash(&bytes).as_bytes()
        })
        .collect()
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Hit/miss counters of a [`FeatureCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to build.
    pub misses: u64,
    /// Entries currently held.
    pub entries: usize,
}

/// Bounded cache of assembled feature tables keyed by input fingerprint.
///
/// Entries are kept in recency order; inserting past `capacity` evicts the least recently
/// used table.
#[derive(Debug)]
pub struct FeatureCache {
    capacity: usize,
    entries: RwLock<IndexMap<Fingerprint, Arc<FeatureTable>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FeatureCache {
    /// Creates a cache holding at most `capacity` tables (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached table for `key`, marking it most recently used.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<FeatureTable>> {
        let mut entries = self.entries.write();
        let idx = entries.get_index_of(key)?;
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        entries.get_index(last).map(|(_, table)| Arc::clone(table))
    }

    /// Inserts a table, evicting the least recently used entries past capacity.
    pub fn insert(&self, key: Fingerprint, table: Arc<FeatureTable>) {
        let mut entries = self.entries.write();
        entries.shift_remove(&key);
        entries.insert(key, table);
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    /// Returns the cached table for `key`, or builds, stores, and returns it.
    ///
    /// The build runs without holding the lock; concurrent misses on the same key may build
    /// twice and the last insert wins.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: Fingerprint,
        build: impl FnOnce() -> Result<FeatureTable, E>,
    ) -> Result<(Arc<FeatureTable>, bool), E> {
        if let Some(table) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((table, true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(build()?);
        self.insert(key, Arc::clone(&table));
        Ok((table, false))
    }

    /// Drops one entry.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.entries.write().shift_remove(key).is_some()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for FeatureCache {
    fn default() -> Self {
        Self::new(4)
    }
}
