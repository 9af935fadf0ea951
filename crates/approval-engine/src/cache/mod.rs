//! Read-through cache for hot workflow lookups
//!
//! A bounded, LRU-evicted map with per-class TTLs. Four entry classes with
//! different staleness tolerance: definitions (immutable once published,
//! long TTL), instance snapshots (short TTL), pending-approvals-per-user
//! lists (very short TTL, highest churn) and generic query results keyed
//! by a parameter hash.
//!
//! The cache is purely an optimization. Every miss falls through to the
//! store, every engine write path invalidates the affected entries, and a
//! disabled cache yields byte-identical operation results. It is an
//! explicitly constructed, injectable value, never a process-wide singleton.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::workflow::{Approval, WorkflowDefinition, WorkflowInstance};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,

    /// TTL for workflow definitions (immutable, so long)
    pub definition_ttl: Duration,

    /// TTL for instance snapshots (mutate frequently)
    pub instance_ttl: Duration,

    /// TTL for pending-approvals-per-user lists (highest churn)
    pub pending_ttl: Duration,

    /// TTL for generic query results
    pub query_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            definition_ttl: Duration::from_secs(3600),
            instance_ttl: Duration::from_secs(30),
            pending_ttl: Duration::from_secs(5),
            query_ttl: Duration::from_secs(60),
        }
    }
}

/// Cache counters, shared with the performance monitor
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Total lookups observed
    pub fn lookups(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate in [0, 1]; 0 when no lookups happened yet
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            0.0
        } else {
            self.hits() as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Definition(Uuid, i32),
    Instance(Uuid),
    PendingForUser(String),
    Query(u64),
}

#[derive(Clone)]
enum CacheValue {
    Definition(WorkflowDefinition),
    Instance(WorkflowInstance),
    Pending(Vec<Approval>),
    Query(serde_json::Value),
}

struct Entry {
    value: CacheValue,
    inserted_at: Instant,
    ttl: Duration,
    /// Monotone recency stamp; smallest is least-recently-used
    last_used: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<CacheKey, Entry>,
    clock: u64,
}

/// Bounded TTL + LRU cache in front of the workflow store
pub struct WorkflowCache {
    config: CacheConfig,
    shard: Mutex<Shard>,
    stats: CacheStats,
}

impl WorkflowCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            shard: Mutex::new(Shard::default()),
            stats: CacheStats::default(),
        }
    }

    /// A cache that never stores and never hits
    ///
    /// Used to run the engine with caching off; all reads fall through to
    /// the store, so outputs are identical to the cached configuration.
    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            max_entries: 0,
            ..CacheConfig::default()
        })
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Current number of live entries
    pub fn len(&self) -> usize {
        self.shard.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.shard.lock().entries.clear();
    }

    fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        if self.config.max_entries == 0 {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut shard = self.shard.lock();
        shard.clock += 1;
        let clock = shard.clock;
        let now = Instant::now();

        match shard.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_used = clock;
                let value = entry.value.clone();
                drop(shard);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(_) => {
                // expired; remove so it does not pin LRU capacity
                shard.entries.remove(key);
                drop(shard);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                drop(shard);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: CacheKey, value: CacheValue, ttl: Duration) {
        if self.config.max_entries == 0 {
            return;
        }

        let mut shard = self.shard.lock();
        shard.clock += 1;
        let clock = shard.clock;

        if shard.entries.len() >= self.config.max_entries && !shard.entries.contains_key(&key) {
            // Evict the least-recently-used entry
            if let Some(lru_key) = shard
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                shard.entries.remove(&lru_key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        shard.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl,
                last_used: clock,
            },
        );
    }

    fn invalidate(&self, key: &CacheKey) {
        let mut shard = self.shard.lock();
        if shard.entries.remove(key).is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    pub fn get_definition(&self, workflow_id: Uuid, version: i32) -> Option<WorkflowDefinition> {
        match self.get(&CacheKey::Definition(workflow_id, version)) {
            Some(CacheValue::Definition(d)) => Some(d),
            _ => None,
        }
    }

    pub fn put_definition(&self, definition: WorkflowDefinition) {
        self.put(
            CacheKey::Definition(definition.id, definition.version),
            CacheValue::Definition(definition),
            self.config.definition_ttl,
        );
    }

    pub fn get_instance(&self, instance_id: Uuid) -> Option<WorkflowInstance> {
        match self.get(&CacheKey::Instance(instance_id)) {
            Some(CacheValue::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn put_instance(&self, instance: WorkflowInstance) {
        self.put(
            CacheKey::Instance(instance.id),
            CacheValue::Instance(instance),
            self.config.instance_ttl,
        );
    }

    pub fn get_pending_for_user(&self, user_id: &str) -> Option<Vec<Approval>> {
        match self.get(&CacheKey::PendingForUser(user_id.to_string())) {
            Some(CacheValue::Pending(p)) => Some(p),
            _ => None,
        }
    }

    pub fn put_pending_for_user(&self, user_id: &str, approvals: Vec<Approval>) {
        self.put(
            CacheKey::PendingForUser(user_id.to_string()),
            CacheValue::Pending(approvals),
            self.config.pending_ttl,
        );
    }

    /// Generic query results keyed by a hash of the parameters
    pub fn get_query<P: Hash>(&self, params: &P) -> Option<serde_json::Value> {
        match self.get(&CacheKey::Query(hash_params(params))) {
            Some(CacheValue::Query(v)) => Some(v),
            _ => None,
        }
    }

    pub fn put_query<P: Hash>(&self, params: &P, result: serde_json::Value) {
        self.put(
            CacheKey::Query(hash_params(params)),
            CacheValue::Query(result),
            self.config.query_ttl,
        );
    }

    // =========================================================================
    // Invalidation (called by every engine write path)
    // =========================================================================

    /// Drop the snapshot of one instance
    ///
    /// Definition entries are deliberately untouched: definitions are
    /// immutable and instance writes cannot stale them.
    pub fn invalidate_instance(&self, instance_id: Uuid) {
        self.invalidate(&CacheKey::Instance(instance_id));
    }

    /// Drop the pending list of one user
    pub fn invalidate_pending_for_user(&self, user_id: &str) {
        self.invalidate(&CacheKey::PendingForUser(user_id.to_string()));
    }
}

fn hash_params<P: Hash>(params: &P) -> u64 {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    hasher.finish()
}
