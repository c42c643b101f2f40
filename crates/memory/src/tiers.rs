//! Hot/warm/cold document storage.
//!
//! Each tier is a directory of `<sha256(key)>.json` records. An in-memory
//! index tracks which tier holds each key plus the access history the
//! migration policy needs; it is rebuilt from the directories on open.
//!
//! Reads record an access but never move a document. Only [`TieredStorage::migrate`]
//! changes tiers, one step at a time, by writing the record to the target
//! tier, repointing the index and then deleting the old copy, all under the
//! key's lock. A reader therefore always finds the document in exactly one
//! place.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    mnemo_common::{Error, ItemFailure, KeyLocks, Metadata, Result, SharedClock},
    mnemo_config::TierConfig,
    mnemo_vault::{AuditAction, PiiCorpus, SYSTEM_ACTOR, ScanCandidate, SealedPayload, Vault},
    serde::Serialize,
    serde_json::json,
    tokio::{fs::File, io::AsyncWriteExt, sync::Mutex},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::schema::{Document, Tier};

const TOMBSTONE_FILE: &str = "tombstones.log";
const MAX_TRACKED_ACCESSES: usize = 1024;

/// Migration thresholds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    pub cold_capacity: Option<usize>,
    pub hot_idle_ms: u64,
    pub warm_idle_ms: u64,
    pub promotion_threshold: u32,
    pub promotion_window_ms: u64,
}

impl From<&TierConfig> for TierPolicy {
    fn from(config: &TierConfig) -> Self {
        Self {
            hot_capacity: config.hot_capacity,
            warm_capacity: config.warm_capacity,
            cold_capacity: config.cold_capacity,
            hot_idle_ms: millis(config.hot_idle()),
            warm_idle_ms: millis(config.warm_idle()),
            promotion_threshold: config.promotion_access_threshold,
            promotion_window_ms: millis(config.promotion_window()),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TierPolicy {
    fn capacity(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Hot => Some(self.hot_capacity),
            Tier::Warm => Some(self.warm_capacity),
            Tier::Cold => self.cold_capacity,
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    tier: Tier,
    partition_id: String,
    metadata: Metadata,
    created_ms: u64,
    modified_ms: u64,
    tier_since_ms: u64,
    last_access_ms: u64,
    recent_accesses: VecDeque<u64>,
    pii_flagged: bool,
    encrypted: bool,
    chunk_count: usize,
}

impl IndexEntry {
    fn new(doc: &Document, tier: Tier, now_ms: u64) -> Self {
        Self {
            tier,
            partition_id: doc.partition_id.clone(),
            metadata: doc.metadata.clone(),
            created_ms: doc.created_ms,
            modified_ms: doc.modified_ms,
            tier_since_ms: now_ms,
            last_access_ms: doc.modified_ms,
            recent_accesses: VecDeque::new(),
            pii_flagged: doc.pii_flagged,
            encrypted: doc.encrypted,
            chunk_count: doc.chunk_count,
        }
    }

    fn record_access(&mut self, now_ms: u64, window_ms: u64) {
        self.last_access_ms = self.last_access_ms.max(now_ms);
        self.recent_accesses.push_back(now_ms);
        self.trim_accesses(now_ms, window_ms);
        while self.recent_accesses.len() > MAX_TRACKED_ACCESSES {
            self.recent_accesses.pop_front();
        }
    }

    fn trim_accesses(&mut self, now_ms: u64, window_ms: u64) {
        let horizon = now_ms.saturating_sub(window_ms);
        while self.recent_accesses.front().is_some_and(|t| *t < horizon) {
            self.recent_accesses.pop_front();
        }
    }

    fn recent_count(&self, now_ms: u64, window_ms: u64) -> usize {
        let horizon = now_ms.saturating_sub(window_ms);
        self.recent_accesses.iter().filter(|t| **t >= horizon).count()
    }

    fn to_stored(&self, key: &str) -> StoredEntry {
        StoredEntry {
            key: key.to_string(),
            tier: self.tier,
            partition_id: self.partition_id.clone(),
            metadata: self.metadata.clone(),
            created_ms: self.created_ms,
            modified_ms: self.modified_ms,
            last_access_ms: self.last_access_ms,
            pii_flagged: self.pii_flagged,
            encrypted: self.encrypted,
            chunk_count: self.chunk_count,
        }
    }
}

/// Index view of a stored document, available without reading its record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEntry {
    pub key: String,
    pub tier: Tier,
    pub partition_id: String,
    pub metadata: Metadata,
    pub created_ms: u64,
    pub modified_ms: u64,
    pub last_access_ms: u64,
    pub pii_flagged: bool,
    pub encrypted: bool,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    Removed(StoredEntry),
    AlreadyDeleted,
    NeverExisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveReason {
    Promoted,
    Idle,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierMove {
    pub key: String,
    pub from: Tier,
    pub to: Tier,
    pub reason: MoveReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub examined: usize,
    pub moves: Vec<TierMove>,
    /// Planned moves dropped because the document changed underneath.
    pub skipped: usize,
    pub failures: Vec<ItemFailure>,
    /// Documents above the optional COLD limit. COLD never evicts.
    pub cold_overflow: usize,
    pub cancelled: bool,
}

impl MigrationReport {
    pub fn promoted(&self) -> usize {
        self.moves.iter().filter(|m| m.reason == MoveReason::Promoted).count()
    }

    pub fn demoted(&self) -> usize {
        self.moves.len() - self.promoted()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialFailure {
                total: self.moves.len() + self.failures.len(),
                failures: self.failures,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
}

impl TierStats {
    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Hot => self.hot,
            Tier::Warm => self.warm,
            Tier::Cold => self.cold,
        }
    }

    pub fn total(&self) -> usize {
        self.hot + self.warm + self.cold
    }
}

pub struct TieredStorage {
    root: PathBuf,
    vault: Arc<Vault>,
    clock: SharedClock,
    policy: TierPolicy,
    index: DashMap<String, IndexEntry>,
    locks: KeyLocks,
    migration: Mutex<()>,
    tombstones: StdMutex<HashSet<String>>,
    tombstone_log: Mutex<File>,
}

impl std::fmt::Debug for TieredStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStorage")
            .field("root", &self.root)
            .field("policy", &self.policy)
            .field("documents", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl TieredStorage {
    /// Open storage under `root`, creating the tier directories and rebuilding
    /// the index from whatever records they hold.
    pub async fn open(
        root: impl Into<PathBuf>,
        config: &TierConfig,
        vault: Arc<Vault>,
        clock: SharedClock,
    ) -> Result<Self> {
        let root = root.into();
        for tier in Tier::ALL {
            tokio::fs::create_dir_all(root.join(tier.as_str())).await?;
        }
        let tombstone_path = root.join(TOMBSTONE_FILE);
        let tombstones = load_tombstones(&tombstone_path).await?;
        let tombstone_log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&tombstone_path)
            .await?;

        let storage = Self {
            root,
            vault,
            clock,
            policy: TierPolicy::from(config),
            index: DashMap::new(),
            locks: KeyLocks::new(),
            migration: Mutex::new(()),
            tombstones: StdMutex::new(tombstones),
            tombstone_log: Mutex::new(tombstone_log),
        };
        storage.recover().await?;
        Ok(storage)
    }

    async fn recover(&self) -> Result<()> {
        let now = self.clock.now_ms();
        for tier in Tier::ALL {
            let dir = self.tier_dir(tier);
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.ends_with(".tmp") {
                    debug!(path = %path.display(), "removing interrupted write");
                    self.vault.shred(&path).await?;
                    continue;
                }
                if !name.ends_with(".json") {
                    continue;
                }
                let doc: Document = match tokio::fs::read(&path)
                    .await
                    .map_err(Error::from)
                    .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
                {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable record");
                        continue;
                    },
                };
                if format!("{}.json", self.vault.safe_filename(&doc.key)) != name {
                    warn!(path = %path.display(), key = %doc.key, "record name does not match its key, skipping");
                    continue;
                }
                if let Some(existing) = self.index.get(&doc.key).map(|e| e.tier) {
                    // Leftover from a move that was interrupted before the
                    // old copy was deleted; the warmer copy wins.
                    warn!(key = %doc.key, kept = %existing, stale = %tier, "removing duplicate record");
                    self.vault.shred(&path).await?;
                    continue;
                }
                self.index
                    .insert(doc.key.clone(), IndexEntry::new(&doc, tier, now));
            }
        }
        let stats = self.stats();
        info!(
            root = %self.root.display(),
            hot = stats.hot,
            warm = stats.warm,
            cold = stats.cold,
            "tiered storage opened"
        );
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.as_str())
    }

    /// Where the record for `key` lives (or would live) in `tier`.
    pub fn record_path(&self, tier: Tier, key: &str) -> PathBuf {
        self.tier_dir(tier)
            .join(format!("{}.json", self.vault.safe_filename(key)))
    }

    /// Persist `doc` in HOT, replacing any earlier version of the key
    /// wherever it lived.
    pub async fn store(&self, mut doc: Document) -> Result<()> {
        if doc.key.is_empty() {
            return Err(Error::InvalidInput("document key must not be empty".into()));
        }
        let _guard = self.locks.lock(&doc.key).await;
        let now = self.clock.now_ms();
        let previous = self.index.get(&doc.key).map(|e| e.tier);

        doc.tier = Tier::Hot;
        self.write_record(Tier::Hot, &doc).await?;
        self.index
            .insert(doc.key.clone(), IndexEntry::new(&doc, Tier::Hot, now));

        if let Some(previous) = previous
            && previous != Tier::Hot
            && let Err(e) = self.vault.shred(&self.record_path(previous, &doc.key)).await
        {
            warn!(key = %doc.key, tier = %previous, error = %e, "failed to remove replaced record");
        }
        debug!(key = %doc.key, partition = %doc.partition_id, "stored document");
        Ok(())
    }

    /// Read the record for `key` and count the access toward promotion.
    pub async fn get(&self, key: &str) -> Result<Document> {
        let _guard = self.locks.lock(key).await;
        let tier = self.tier_of(key).ok_or_else(|| Error::not_found(key))?;
        let doc = self.read_record(tier, key).await?;
        let now = self.clock.now_ms();
        if let Some(mut entry) = self.index.get_mut(key) {
            entry.record_access(now, self.policy.promotion_window_ms);
        }
        Ok(doc)
    }

    /// Count a read served from elsewhere (the cache) toward promotion
    /// without touching the record. Returns whether `key` is stored.
    pub async fn record_access(&self, key: &str) -> bool {
        let _guard = self.locks.lock(key).await;
        let now = self.clock.now_ms();
        match self.index.get_mut(key) {
            Some(mut entry) => {
                entry.record_access(now, self.policy.promotion_window_ms);
                true
            },
            None => false,
        }
    }

    /// Securely delete every copy of `key`. Deleting a key that was deleted
    /// before is a successful no-op that is still audited.
    pub async fn remove(&self, key: &str, actor: &str) -> Result<RemoveOutcome> {
        let _guard = self.locks.lock(key).await;
        self.remove_locked(key, actor).await
    }

    /// Remove `key` only if `still_wanted` accepts its current entry, checked
    /// under the key lock. `Ok(None)` when the key is absent or was kept.
    pub async fn remove_if<F>(&self, key: &str, actor: &str, still_wanted: F) -> Result<Option<StoredEntry>>
    where
        F: FnOnce(&StoredEntry) -> bool + Send,
    {
        let _guard = self.locks.lock(key).await;
        if !self.entry(key).is_some_and(|entry| still_wanted(&entry)) {
            return Ok(None);
        }
        match self.remove_locked(key, actor).await? {
            RemoveOutcome::Removed(entry) => Ok(Some(entry)),
            RemoveOutcome::AlreadyDeleted | RemoveOutcome::NeverExisted => Ok(None),
        }
    }

    async fn remove_locked(&self, key: &str, actor: &str) -> Result<RemoveOutcome> {
        let entry = self.index.get(key).map(|e| e.to_stored(key));
        let paths: Vec<PathBuf> = Tier::ALL
            .iter()
            .map(|tier| self.record_path(*tier, key))
            .collect();

        match entry {
            Some(entry) => {
                self.vault.secure_delete(key, actor, &paths).await?;
                self.index.remove(key);
                self.add_tombstone(key).await?;
                info!(key, tier = %entry.tier, actor, "document removed");
                Ok(RemoveOutcome::Removed(entry))
            },
            None if self.was_deleted(key) => {
                self.vault.secure_delete(key, actor, &paths).await?;
                Ok(RemoveOutcome::AlreadyDeleted)
            },
            None => Ok(RemoveOutcome::NeverExisted),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn was_deleted(&self, key: &str) -> bool {
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn tier_of(&self, key: &str) -> Option<Tier> {
        self.index.get(key).map(|e| e.tier)
    }

    pub fn entry(&self, key: &str) -> Option<StoredEntry> {
        self.index.get(key).map(|e| e.to_stored(key))
    }

    pub fn entries(&self) -> Vec<StoredEntry> {
        self.index
            .iter()
            .map(|e| e.value().to_stored(e.key()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> TierStats {
        let mut stats = TierStats::default();
        for entry in self.index.iter() {
            match entry.tier {
                Tier::Hot => stats.hot += 1,
                Tier::Warm => stats.warm += 1,
                Tier::Cold => stats.cold += 1,
            }
        }
        stats
    }

    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Apply promotion, idle demotion and capacity rules once.
    ///
    /// Runs are serialized; calling again with nothing to do moves nothing.
    /// Cancellation is checked before each move. A failed move leaves the
    /// document where it was, is audited and lands in `failures`.
    pub async fn migrate(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let _run = self.migration.lock().await;
        let now = self.clock.now_ms();
        let plan = self.plan(now);
        let mut report = MigrationReport {
            examined: self.index.len(),
            ..MigrationReport::default()
        };

        for mv in plan {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.move_document(&mv, now).await {
                Ok(true) => report.moves.push(mv),
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %mv.key, from = %mv.from, to = %mv.to, error = %e, "tier move failed");
                    self.vault
                        .record_best_effort(
                            AuditAction::MigrationFailure,
                            SYSTEM_ACTOR,
                            &mv.key,
                            json!({ "from": mv.from, "to": mv.to, "error": e.to_string() }),
                        )
                        .await;
                    report.failures.push(ItemFailure::new(mv.key.clone(), e));
                },
            }
        }

        if let Some(limit) = self.policy.cold_capacity {
            let cold = self.stats().cold;
            if cold > limit {
                report.cold_overflow = cold - limit;
                warn!(cold, limit, "cold tier above its configured capacity");
            }
        }

        if !report.moves.is_empty() || !report.failures.is_empty() {
            info!(
                promoted = report.promoted(),
                demoted = report.demoted(),
                failures = report.failures.len(),
                cancelled = report.cancelled,
                "tier migration finished"
            );
        }
        Ok(report)
    }

    fn plan(&self, now: u64) -> Vec<TierMove> {
        struct Candidate {
            key: String,
            tier: Tier,
            last_access_ms: u64,
        }

        let policy = &self.policy;
        let mut candidates = Vec::with_capacity(self.index.len());
        let mut targets: HashMap<String, (Tier, MoveReason)> = HashMap::new();

        for entry in self.index.iter() {
            let e = entry.value();
            let recent = e.recent_count(now, policy.promotion_window_ms);
            let idle = now.saturating_sub(e.last_access_ms.max(e.tier_since_ms));
            let target = if e.tier != Tier::Hot && recent > policy.promotion_threshold as usize {
                e.tier.warmer().map(|t| (t, MoveReason::Promoted))
            } else {
                match e.tier {
                    Tier::Hot if idle > policy.hot_idle_ms => Some((Tier::Warm, MoveReason::Idle)),
                    Tier::Warm if idle > policy.warm_idle_ms => Some((Tier::Cold, MoveReason::Idle)),
                    _ => None,
                }
            };
            if let Some(target) = target {
                targets.insert(entry.key().clone(), target);
            }
            candidates.push(Candidate {
                key: entry.key().clone(),
                tier: e.tier,
                last_access_ms: e.last_access_ms,
            });
        }

        // Least recently accessed first when capacity forces demotions.
        candidates.sort_by(|a, b| {
            a.last_access_ms
                .cmp(&b.last_access_ms)
                .then_with(|| a.key.cmp(&b.key))
        });

        for tier in [Tier::Hot, Tier::Warm] {
            let Some(limit) = policy.capacity(tier) else {
                continue;
            };
            let projected = |c: &Candidate, targets: &HashMap<String, (Tier, MoveReason)>| {
                targets.get(&c.key).map_or(c.tier, |(t, _)| *t)
            };
            let count = candidates
                .iter()
                .filter(|c| projected(c, &targets) == tier)
                .count();
            let mut excess = count.saturating_sub(limit);
            if excess == 0 {
                continue;
            }
            let Some(colder) = tier.colder() else {
                continue;
            };
            for c in &candidates {
                if excess == 0 {
                    break;
                }
                // Only one step per run: skip documents that are already
                // moving down into this tier.
                if projected(c, &targets) != tier || c.tier < tier {
                    continue;
                }
                if colder == c.tier {
                    targets.remove(&c.key);
                } else {
                    targets.insert(c.key.clone(), (colder, MoveReason::Capacity));
                }
                excess -= 1;
            }
        }

        let mut moves: Vec<TierMove> = candidates
            .into_iter()
            .filter_map(|c| {
                targets.remove(&c.key).map(|(to, reason)| TierMove {
                    key: c.key,
                    from: c.tier,
                    to,
                    reason,
                })
            })
            .collect();
        // Demotions free room before promotions fill it.
        moves.sort_by_key(|m| m.reason == MoveReason::Promoted);
        moves
    }

    /// Returns `false` when the document was deleted or moved since planning.
    async fn move_document(&self, mv: &TierMove, now: u64) -> Result<bool> {
        let _guard = self.locks.lock(&mv.key).await;
        if self.tier_of(&mv.key) != Some(mv.from) {
            return Ok(false);
        }

        let mut doc = self.read_record(mv.from, &mv.key).await?;
        doc.tier = mv.to;
        self.write_record(mv.to, &doc).await?;

        if let Some(mut entry) = self.index.get_mut(&mv.key) {
            entry.tier = mv.to;
            entry.tier_since_ms = now;
        }

        if let Err(e) = self.vault.shred(&self.record_path(mv.from, &mv.key)).await {
            warn!(key = %mv.key, tier = %mv.from, error = %e, "stale copy left behind after move");
        }
        debug!(key = %mv.key, from = %mv.from, to = %mv.to, reason = ?mv.reason, "moved document");
        Ok(true)
    }

    async fn write_record(&self, tier: Tier, doc: &Document) -> Result<()> {
        let path = self.record_path(tier, &doc.key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(doc)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_record(&self, tier: Tier, key: &str) -> Result<Document> {
        let path = self.record_path(tier, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::integrity(key, format!("record missing from {tier} tier")));
            },
            Err(e) => return Err(e.into()),
        };
        let doc: Document = serde_json::from_slice(&bytes)
            .map_err(|e| Error::integrity(key, format!("malformed record: {e}")))?;
        if doc.key != key {
            return Err(Error::integrity(key, "record belongs to another key"));
        }
        Ok(doc)
    }

    async fn add_tombstone(&self, key: &str) -> Result<()> {
        let mut line = serde_json::to_vec(key)?;
        line.push(b'\n');
        {
            let mut log = self.tombstone_log.lock().await;
            log.write_all(&line).await?;
            log.flush().await?;
        }
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
        Ok(())
    }
}

async fn load_tombstones(path: &Path) -> Result<HashSet<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<String>(line).ok())
        .collect())
}

#[async_trait]
impl PiiCorpus for TieredStorage {
    async fn scan_candidates(&self) -> Result<Vec<ScanCandidate>> {
        Ok(self
            .index
            .iter()
            .map(|e| ScanCandidate {
                key: e.key().clone(),
                metadata: e.metadata.clone(),
                modified_ms: e.modified_ms,
                pii_flagged: e.pii_flagged,
            })
            .collect())
    }

    /// Scanning does not count as an access.
    async fn load_payload(&self, key: &str) -> Result<SealedPayload> {
        let _guard = self.locks.lock(key).await;
        let tier = self.tier_of(key).ok_or_else(|| Error::not_found(key))?;
        let (bytes, encrypted) = self
            .read_record(tier, key)
            .await
            .map(|doc| (doc.content, doc.encrypted))?;
        Ok(SealedPayload { bytes, encrypted })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::test_support::test_vault,
        mnemo_common::{Clock, ManualClock},
        tempfile::TempDir,
    };

    const HOUR: Duration = Duration::from_secs(3600);

    fn config() -> TierConfig {
        TierConfig {
            hot_capacity: 100,
            warm_capacity: 100,
            cold_capacity: None,
            hot_idle_secs: 3600,
            warm_idle_secs: 2 * 3600,
            promotion_access_threshold: 2,
            promotion_window_secs: 600,
        }
    }

    #[test]
    fn policy_converts_idle_times_to_millis() {
        let mut tiers = config();
        tiers.warm_idle_secs = u64::MAX;
        let policy = TierPolicy::from(&tiers);
        assert_eq!(policy.hot_idle_ms, 3_600_000);
        assert_eq!(policy.promotion_window_ms, 600_000);
        assert_eq!(policy.warm_idle_ms, u64::MAX);
    }

    fn doc(key: &str, body: &str) -> Document {
        Document {
            key: key.into(),
            content: body.as_bytes().to_vec(),
            metadata: Metadata::new(),
            owner: "tester".into(),
            created_ms: 1_000,
            modified_ms: 1_000,
            partition_id: "default".into(),
            tier: Tier::Cold,
            encrypted: false,
            pii_flagged: false,
            chunk_count: 1,
        }
    }

    async fn open(tmp: &TempDir, config: &TierConfig) -> (TieredStorage, ManualClock, Arc<Vault>) {
        let clock = ManualClock::at_ms(1_000);
        let vault = test_vault(tmp.path(), clock.shared()).await;
        let storage = TieredStorage::open(tmp.path(), config, Arc::clone(&vault), clock.shared())
            .await
            .unwrap();
        (storage, clock, vault)
    }

    async fn migrate(storage: &TieredStorage) -> MigrationReport {
        storage.migrate(&CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn store_lands_in_hot() {
        let tmp = TempDir::new().unwrap();
        let (storage, _, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        assert_eq!(storage.tier_of("a"), Some(Tier::Hot));
        let read = storage.get("a").await.unwrap();
        assert_eq!(read.content, b"alpha");
        assert_eq!(read.tier, Tier::Hot);
        assert!(storage.record_path(Tier::Hot, "a").exists());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (storage, _, _) = open(&tmp, &config()).await;
        assert!(storage.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unaccessed_document_sinks_to_cold_and_stays() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();

        let mut seen = vec![storage.tier_of("a").unwrap()];
        for _ in 0..8 {
            clock.advance(HOUR + Duration::from_secs(1));
            migrate(&storage).await;
            seen.push(storage.tier_of("a").unwrap());
        }

        assert_eq!(seen.last(), Some(&Tier::Cold));
        // Tiers only ever get colder without accesses.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(!storage.record_path(Tier::Hot, "a").exists());
        assert!(!storage.record_path(Tier::Warm, "a").exists());
        assert_eq!(storage.get("a").await.unwrap().content, b"alpha");
    }

    #[tokio::test]
    async fn reads_do_not_move_but_promote_on_migrate() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        clock.advance(HOUR * 2);
        migrate(&storage).await;
        assert_eq!(storage.tier_of("a"), Some(Tier::Warm));

        for _ in 0..3 {
            storage.get("a").await.unwrap();
        }
        assert_eq!(storage.tier_of("a"), Some(Tier::Warm));

        let report = migrate(&storage).await;
        assert_eq!(report.promoted(), 1);
        assert_eq!(storage.tier_of("a"), Some(Tier::Hot));
    }

    #[tokio::test]
    async fn recorded_accesses_count_toward_promotion() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        clock.advance(HOUR * 2);
        migrate(&storage).await;
        assert_eq!(storage.tier_of("a"), Some(Tier::Warm));

        assert!(storage.record_access("a").await);
        assert!(storage.record_access("a").await);
        assert!(!storage.record_access("missing").await);
        assert_eq!(storage.entry("a").unwrap().last_access_ms, clock.now_ms());

        assert_eq!(migrate(&storage).await.promoted(), 1);
        assert_eq!(storage.tier_of("a"), Some(Tier::Hot));
    }

    #[tokio::test]
    async fn accesses_outside_window_do_not_promote() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        clock.advance(HOUR * 2);
        migrate(&storage).await;

        for _ in 0..3 {
            storage.get("a").await.unwrap();
        }
        clock.advance(Duration::from_secs(601));
        let report = migrate(&storage).await;
        assert_eq!(report.promoted(), 0);
        assert_eq!(storage.tier_of("a"), Some(Tier::Warm));
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        clock.advance(HOUR * 2);
        assert_eq!(migrate(&storage).await.moves.len(), 1);
        assert_eq!(migrate(&storage).await.moves.len(), 0);
    }

    #[tokio::test]
    async fn hot_overflow_demotes_least_recently_accessed() {
        let tmp = TempDir::new().unwrap();
        let config = TierConfig {
            hot_capacity: 2,
            ..config()
        };
        let (storage, clock, _) = open(&tmp, &config).await;
        for key in ["a", "b", "c"] {
            storage.store(doc(key, key)).await.unwrap();
        }
        clock.advance(Duration::from_secs(5));
        storage.get("a").await.unwrap();
        storage.get("c").await.unwrap();

        let report = migrate(&storage).await;
        assert_eq!(report.moves, vec![TierMove {
            key: "b".into(),
            from: Tier::Hot,
            to: Tier::Warm,
            reason: MoveReason::Capacity,
        }]);
        assert_eq!(storage.stats(), TierStats { hot: 2, warm: 1, cold: 0 });
    }

    #[tokio::test]
    async fn failed_move_leaves_document_in_place() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, vault) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        storage.store(doc("b", "beta")).await.unwrap();

        // Make the warm tier unwritable by replacing the directory with a file.
        let warm = tmp.path().join("warm");
        std::fs::remove_dir(&warm).unwrap();
        std::fs::write(&warm, b"not a directory").unwrap();

        clock.advance(HOUR * 2);
        let report = migrate(&storage).await;
        assert_eq!(report.failures.len(), 2);
        assert_eq!(storage.tier_of("a"), Some(Tier::Hot));
        assert_eq!(storage.get("b").await.unwrap().content, b"beta");
        assert!(report.into_result().is_err());

        let audit = vault.audit_log().read_all().await.unwrap();
        assert_eq!(
            audit
                .iter()
                .filter(|e| e.action == AuditAction::MigrationFailure)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn cancelled_migration_moves_nothing() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        clock.advance(HOUR * 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = storage.migrate(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(storage.tier_of("a"), Some(Tier::Hot));
    }

    #[tokio::test]
    async fn reads_during_migration_never_miss() {
        let tmp = TempDir::new().unwrap();
        let (storage, clock, _) = open(&tmp, &config()).await;
        let storage = Arc::new(storage);
        for i in 0..40 {
            storage.store(doc(&format!("k{i}"), "body")).await.unwrap();
        }
        clock.advance(HOUR * 2);

        let reader = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                for round in 0..5 {
                    for i in 0..40 {
                        let key = format!("k{i}");
                        assert_eq!(storage.get(&key).await.unwrap().content, b"body", "{key} round {round}");
                    }
                }
            })
        };
        let report = storage.migrate(&CancellationToken::new()).await.unwrap();
        reader.await.unwrap();
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_remembered() {
        let tmp = TempDir::new().unwrap();
        let config = config();
        {
            let (storage, _, _) = open(&tmp, &config).await;
            storage.store(doc("a", "alpha")).await.unwrap();
            assert!(matches!(
                storage.remove("a", "alice").await.unwrap(),
                RemoveOutcome::Removed(_)
            ));
            assert_eq!(
                storage.remove("a", "alice").await.unwrap(),
                RemoveOutcome::AlreadyDeleted
            );
            assert_eq!(
                storage.remove("never", "alice").await.unwrap(),
                RemoveOutcome::NeverExisted
            );
        }
        let (storage, _, _) = open(&tmp, &config).await;
        assert!(!storage.contains("a"));
        assert_eq!(
            storage.remove("a", "alice").await.unwrap(),
            RemoveOutcome::AlreadyDeleted
        );
    }

    #[tokio::test]
    async fn reopen_recovers_tiers_and_drops_duplicates() {
        let tmp = TempDir::new().unwrap();
        let config = config();
        {
            let (storage, clock, _) = open(&tmp, &config).await;
            storage.store(doc("a", "alpha")).await.unwrap();
            storage.store(doc("b", "beta")).await.unwrap();
            clock.advance(HOUR * 2);
            migrate(&storage).await;
            // Simulate a crash between copy and delete for "b".
            std::fs::copy(
                storage.record_path(Tier::Warm, "b"),
                storage.record_path(Tier::Cold, "b"),
            )
            .unwrap();
        }
        let (storage, _, _) = open(&tmp, &config).await;
        assert_eq!(storage.stats(), TierStats { hot: 0, warm: 2, cold: 0 });
        assert!(!storage.record_path(Tier::Cold, "b").exists());
        assert_eq!(storage.get("b").await.unwrap().content, b"beta");
    }

    #[tokio::test]
    async fn corrupted_record_is_integrity_error() {
        let tmp = TempDir::new().unwrap();
        let (storage, _, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        std::fs::write(storage.record_path(Tier::Hot, "a"), b"{ not json").unwrap();
        assert!(storage.get("a").await.unwrap_err().is_integrity());
    }

    #[tokio::test]
    async fn corpus_view_skips_access_tracking() {
        let tmp = TempDir::new().unwrap();
        let (storage, _, _) = open(&tmp, &config()).await;
        storage.store(doc("a", "alpha")).await.unwrap();
        let before = storage.entry("a").unwrap().last_access_ms;
        let candidates = storage.scan_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        let payload = storage.load_payload("a").await.unwrap();
        assert_eq!(payload.bytes, b"alpha");
        assert_eq!(storage.entry("a").unwrap().last_access_ms, before);
    }
}
