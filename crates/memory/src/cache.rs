//! Two-level cache: an in-memory LRU (L1) in front of an encrypted on-disk
//! LRU (L2).
//!
//! Every `put` lands in L1 and is mirrored to L2 before returning, so a value
//! pushed out of L1 is still served from L2. Both levels honour the entry's
//! TTL; expired entries are dropped when touched and by
//! [`CachingManager::sweep_expired`]. L2 files are sealed with the master key
//! and bound to the cache key.

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    lru::LruCache,
    mnemo_common::{KeyLocks, Result, SharedClock},
    mnemo_config::CacheConfig,
    mnemo_vault::{AuditAction, SYSTEM_ACTOR, Vault},
    serde::Serialize,
    serde_json::json,
    tracing::{debug, warn},
};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at_ms: u64,
}

type Level<V> = LruCache<String, Entry<V>>;

fn level<V>(capacity: usize) -> Level<V> {
    LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
}

/// Insert or replace `key`; returns the least recently used entry when the
/// level was full. Replacing an existing key never evicts.
fn insert<V>(level: &mut Level<V>, key: &str, value: V, expires_at_ms: u64) -> Option<(String, Entry<V>)> {
    level.pop(key);
    level.push(key.to_string(), Entry {
        value,
        expires_at_ms,
    })
}

fn expired_keys<V>(level: &Level<V>, now_ms: u64) -> Vec<String> {
    level
        .iter()
        .filter(|(_, e)| e.expires_at_ms <= now_ms)
        .map(|(k, _)| k.clone())
        .collect()
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    demotions: AtomicU64,
    dropped: AtomicU64,
    l2_evictions: AtomicU64,
    expired: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for c in [
            &self.l1_hits,
            &self.l1_misses,
            &self.l2_hits,
            &self.l2_misses,
            &self.demotions,
            &self.dropped,
            &self.l2_evictions,
            &self.expired,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of cache counters. Counters only grow until [`CachingManager::clear`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// L1 overflow entries kept in L2.
    pub demotions: u64,
    /// L1 overflow entries discarded because L2 had no room.
    pub dropped: u64,
    pub l2_evictions: u64,
    pub expired: u64,
    pub l1_size: usize,
    pub l2_size: usize,
    pub hit_ratio: f64,
}

pub struct CachingManager {
    l1: Mutex<Level<Vec<u8>>>,
    l2: Mutex<Level<()>>,
    l2_enabled: bool,
    dir: PathBuf,
    vault: Arc<Vault>,
    clock: SharedClock,
    default_ttl: Duration,
    locks: KeyLocks,
    counters: Counters,
}

impl std::fmt::Debug for CachingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingManager")
            .field("dir", &self.dir)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl CachingManager {
    /// Open the cache rooted at `dir`. L2 files left by a previous process
    /// are shredded; the cache never outlives its process.
    pub async fn open(
        dir: impl Into<PathBuf>,
        config: &CacheConfig,
        vault: Arc<Vault>,
        clock: SharedClock,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let mut stale = 0usize;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() && vault.shred(&entry.path()).await? {
                stale += 1;
            }
        }
        if stale > 0 {
            debug!(dir = %dir.display(), stale, "discarded stale L2 cache files");
        }

        Ok(Self {
            l1: Mutex::new(level(config.l1_capacity)),
            l2: Mutex::new(level(config.l2_capacity)),
            l2_enabled: config.l2_capacity > 0,
            dir,
            vault,
            clock,
            default_ttl: config.default_ttl(),
            locks: KeyLocks::new(),
            counters: Counters::default(),
        })
    }

    fn l1(&self) -> MutexGuard<'_, Level<Vec<u8>>> {
        self.l1.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn l2(&self) -> MutexGuard<'_, Level<()>> {
        self.l2.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn l2_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", self.vault.safe_filename(key)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let _guard = self.locks.lock(key).await;
        let now = self.clock.now_ms();

        {
            let mut l1 = self.l1();
            match l1.peek(key).map(|e| e.expires_at_ms) {
                Some(expires) if expires > now => {
                    Counters::bump(&self.counters.l1_hits);
                    return l1.get(key).map(|e| e.value.clone());
                },
                Some(_) => {
                    l1.pop(key);
                    Counters::bump(&self.counters.expired);
                },
                None => {},
            }
        }
        Counters::bump(&self.counters.l1_misses);

        if !self.l2_enabled {
            Counters::bump(&self.counters.l2_misses);
            return None;
        }

        let (live, expired) = {
            let mut l2 = self.l2();
            match l2.peek(key).map(|e| e.expires_at_ms) {
                Some(expires) if expires > now => {
                    l2.promote(key);
                    (Some(expires), false)
                },
                Some(_) => {
                    l2.pop(key);
                    (None, true)
                },
                None => (None, false),
            }
        };
        if expired {
            Counters::bump(&self.counters.expired);
            self.discard_l2_file(key).await;
        }
        let Some(expires_at_ms) = live else {
            Counters::bump(&self.counters.l2_misses);
            return None;
        };

        match self.read_l2(key).await {
            Ok(value) => {
                Counters::bump(&self.counters.l2_hits);
                self.insert_l1(key, value.clone(), expires_at_ms).await;
                Some(value)
            },
            Err(e) => {
                warn!(key, error = %e, "dropping unreadable L2 cache entry");
                if e.is_integrity() {
                    self.vault
                        .record_best_effort(
                            AuditAction::IntegrityFailure,
                            SYSTEM_ACTOR,
                            key,
                            json!({ "during": "cache_read" }),
                        )
                        .await;
                }
                self.l2().pop(key);
                self.discard_l2_file(key).await;
                Counters::bump(&self.counters.l2_misses);
                None
            },
        }
    }

    /// Store `value` under `key` with `ttl` (the configured default when
    /// `None`). The value is readable from L1 as soon as this returns.
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let _guard = self.locks.lock(key).await;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at_ms = self
            .clock
            .now_ms()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));

        self.insert_l1(key, value.clone(), expires_at_ms).await;
        if self.l2_enabled {
            self.mirror_to_l2(key, &value, expires_at_ms).await;
        }
    }

    /// Remove `key` from both levels. Returns whether it was cached.
    pub async fn invalidate(&self, key: &str) -> bool {
        let _guard = self.locks.lock(key).await;
        let in_l1 = self.l1().pop(key).is_some();
        let in_l2 = self.l2().pop(key).is_some();
        self.discard_l2_file(key).await;
        in_l1 || in_l2
    }

    /// Drop every expired entry from both levels. Returns how many went.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = 0;

        {
            let mut l1 = self.l1();
            for key in expired_keys(&l1, now) {
                l1.pop(&key);
                removed += 1;
            }
        }

        let l2_expired = {
            let mut l2 = self.l2();
            let keys = expired_keys(&l2, now);
            for key in &keys {
                l2.pop(key);
            }
            keys
        };
        removed += l2_expired.len();
        for key in &l2_expired {
            if let Some(_guard) = self.locks.try_lock(key) {
                self.discard_l2_file(key).await;
            }
        }

        self.counters.expired.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Empty both levels and reset the counters.
    pub async fn clear(&self) {
        self.l1().clear();
        let keys: Vec<String> = {
            let mut l2 = self.l2();
            let keys = l2.iter().map(|(k, _)| k.clone()).collect();
            l2.clear();
            keys
        };
        for key in &keys {
            self.discard_l2_file(key).await;
        }
        self.counters.reset();
    }

    pub fn get_stats(&self) -> CacheStats {
        let c = &self.counters;
        let l1_hits = c.l1_hits.load(Ordering::Relaxed);
        let l1_misses = c.l1_misses.load(Ordering::Relaxed);
        let l2_hits = c.l2_hits.load(Ordering::Relaxed);
        let lookups = l1_hits + l1_misses;
        CacheStats {
            l1_hits,
            l1_misses,
            l2_hits,
            l2_misses: c.l2_misses.load(Ordering::Relaxed),
            demotions: c.demotions.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            l2_evictions: c.l2_evictions.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            l1_size: self.l1().len(),
            l2_size: self.l2().len(),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / lookups as f64
            },
        }
    }

    /// Release lock entries for keys nobody is using.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Caller holds the lock for `key`. Overflow victims are demoted to L2.
    async fn insert_l1(&self, key: &str, value: Vec<u8>, expires_at_ms: u64) {
        let victim = insert(&mut self.l1(), key, value, expires_at_ms);
        if let Some((victim, entry)) = victim {
            self.demote(&victim, entry).await;
        }
    }

    async fn demote(&self, key: &str, entry: Entry<Vec<u8>>) {
        let now = self.clock.now_ms();
        if entry.expires_at_ms <= now {
            Counters::bump(&self.counters.expired);
            return;
        }
        let (present, has_room) = {
            let l2 = self.l2();
            (
                l2.peek(key).is_some_and(|e| e.expires_at_ms > now),
                l2.len() < l2.cap().get(),
            )
        };
        if present {
            Counters::bump(&self.counters.demotions);
            return;
        }
        if !self.l2_enabled || !has_room {
            Counters::bump(&self.counters.dropped);
            return;
        }
        // Another task owns the key; its own write decides what L2 holds.
        let Some(_guard) = self.locks.try_lock(key) else {
            Counters::bump(&self.counters.dropped);
            return;
        };
        self.mirror_to_l2(key, &entry.value, entry.expires_at_ms).await;
        Counters::bump(&self.counters.demotions);
    }

    /// Caller holds the lock for `key`.
    async fn mirror_to_l2(&self, key: &str, value: &[u8], expires_at_ms: u64) {
        if let Err(e) = self.write_l2(key, value).await {
            warn!(key, error = %e, "failed to write L2 cache entry");
            self.l2().pop(key);
            self.discard_l2_file(key).await;
            return;
        }
        let victim = insert(&mut self.l2(), key, (), expires_at_ms);
        if let Some((victim, _)) = victim {
            Counters::bump(&self.counters.l2_evictions);
            // A busy victim keeps its file; the owner overwrites or discards it.
            if let Some(_guard) = self.locks.try_lock(&victim) {
                self.discard_l2_file(&victim).await;
            }
        }
    }

    async fn write_l2(&self, key: &str, value: &[u8]) -> Result<()> {
        let sealed = self.vault.encrypt(value, &l2_subject(key))?;
        let path = self.l2_path(key);
        let tmp = path.with_extension("bin.tmp");
        tokio::fs::write(&tmp, &sealed).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_l2(&self, key: &str) -> Result<Vec<u8>> {
        let sealed = tokio::fs::read(self.l2_path(key)).await?;
        self.vault.decrypt(&sealed, &l2_subject(key))
    }

    async fn discard_l2_file(&self, key: &str) {
        if let Err(e) = self.vault.shred(&self.l2_path(key)).await {
            warn!(key, error = %e, "failed to remove L2 cache file");
        }
    }
}

fn l2_subject(key: &str) -> String {
    format!("cache:{key}")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::test_support::test_vault,
        mnemo_common::ManualClock,
        tempfile::TempDir,
    };

    async fn cache_with(
        tmp: &TempDir,
        l1: usize,
        l2: usize,
    ) -> (CachingManager, ManualClock, Arc<Vault>) {
        let clock = ManualClock::at_ms(1_000_000);
        let vault = test_vault(tmp.path(), clock.shared()).await;
        let config = CacheConfig {
            l1_capacity: l1,
            l2_capacity: l2,
            default_ttl_secs: 60,
        };
        let cache = CachingManager::open(tmp.path().join("cache"), &config, Arc::clone(&vault), clock.shared())
            .await
            .unwrap();
        (cache, clock, vault)
    }

    #[tokio::test]
    async fn read_your_writes_across_l1_eviction() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 2, 16).await;

        cache.put("a", b"alpha".to_vec(), None).await;
        assert_eq!(cache.get("a").await.unwrap(), b"alpha");

        cache.put("b", b"beta".to_vec(), None).await;
        cache.put("c", b"gamma".to_vec(), None).await;
        cache.put("d", b"delta".to_vec(), None).await;

        assert_eq!(cache.get("a").await.unwrap(), b"alpha");
        let stats = cache.get_stats();
        assert_eq!(stats.l2_hits, 1);
        assert!(stats.demotions >= 2);
        assert_eq!(stats.l1_size, 2);
        assert_eq!(stats.l2_size, 4);
    }

    #[tokio::test]
    async fn overwrite_replaces_value_in_both_levels() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 1, 4).await;
        cache.put("k", b"v1".to_vec(), None).await;
        cache.put("k", b"v2".to_vec(), None).await;
        assert_eq!(cache.get("k").await.unwrap(), b"v2");
        cache.put("other", b"x".to_vec(), None).await;
        assert_eq!(cache.get("k").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn l2_files_are_encrypted() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 4, 4).await;
        cache.put("secret", b"plain words here".to_vec(), None).await;
        let mut files = std::fs::read_dir(cache.dir()).unwrap();
        let bytes = std::fs::read(files.next().unwrap().unwrap().path()).unwrap();
        assert!(!bytes.windows(5).any(|w| w == b"plain"));
    }

    #[tokio::test]
    async fn disabled_l2_drops_overflow() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 1, 0).await;
        cache.put("a", b"1".to_vec(), None).await;
        cache.put("b", b"2".to_vec(), None).await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await.unwrap(), b"2");
        assert_eq!(cache.get_stats().dropped, 1);
    }

    #[tokio::test]
    async fn reads_refresh_l1_recency() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 2, 0).await;
        cache.put("a", b"1".to_vec(), None).await;
        cache.put("b", b"2".to_vec(), None).await;
        assert_eq!(cache.get("a").await.unwrap(), b"1");
        cache.put("c", b"3".to_vec(), None).await;

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await.unwrap(), b"1");
        assert_eq!(cache.get("c").await.unwrap(), b"3");
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let tmp = TempDir::new().unwrap();
        let (cache, clock, _) = cache_with(&tmp, 4, 4).await;
        cache.put("short", b"s".to_vec(), Some(Duration::from_secs(5))).await;
        cache.put("long", b"l".to_vec(), None).await;

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await.unwrap(), b"l");

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.sweep_expired().await, 2);
        assert_eq!(cache.get_stats().l2_size, 0);
    }

    #[tokio::test]
    async fn invalidate_removes_both_levels() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 4, 4).await;
        cache.put("k", b"v".to_vec(), None).await;
        assert!(cache.invalidate("k").await);
        assert!(!cache.invalidate("k").await);
        assert_eq!(cache.get("k").await, None);
        assert_eq!(std::fs::read_dir(cache.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn tampered_l2_entry_is_a_miss_and_audited() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, vault) = cache_with(&tmp, 1, 4).await;
        cache.put("victim", b"payload".to_vec(), None).await;
        cache.put("other", b"x".to_vec(), None).await;

        let path = cache.l2_path("victim");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(cache.get("victim").await, None);
        let audit = vault.audit_log().read_all().await.unwrap();
        assert!(audit
            .iter()
            .any(|e| e.action == AuditAction::IntegrityFailure && e.subject == "victim"));
    }

    #[tokio::test]
    async fn clear_resets_counters() {
        let tmp = TempDir::new().unwrap();
        let (cache, _, _) = cache_with(&tmp, 4, 4).await;
        cache.put("k", b"v".to_vec(), None).await;
        cache.get("k").await;
        cache.get("missing").await;
        let stats = cache.get_stats();
        assert_eq!((stats.l1_hits, stats.l1_misses, stats.l2_misses), (1, 1, 1));
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);

        cache.clear().await;
        let stats = cache.get_stats();
        assert_eq!((stats.l1_hits, stats.l1_size, stats.l2_size), (0, 0, 0));
    }

    #[tokio::test]
    async fn stale_files_are_removed_on_open() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("leftover.bin"), b"old").unwrap();
        let (cache, _, _) = cache_with(&tmp, 2, 2).await;
        assert_eq!(std::fs::read_dir(cache.dir()).unwrap().count(), 0);
    }
}
