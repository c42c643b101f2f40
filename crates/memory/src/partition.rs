//! Logical grouping of documents by type, domain and creation month.
//!
//! Partitions carry request statistics and a health score, and are the unit
//! of inactivity cleanup. Membership is persisted to `partitions.json` but the
//! tier index is authoritative: on open, members are rebuilt from storage.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::DateTime,
    dashmap::DashMap,
    mnemo_common::{Error, ItemFailure, Metadata, Result, SharedClock},
    mnemo_config::{HealthWeights, PartitioningConfig},
    mnemo_vault::{AuditAction, Vault},
    serde::{Deserialize, Serialize},
    serde_json::json,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::tiers::{StoredEntry, TieredStorage};

pub const DEFAULT_PARTITION: &str = "default";
const PARTITIONS_FILE: &str = "partitions.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub requests: u64,
    pub errors: u64,
    pub total_latency_ms: f64,
}

impl PartitionStats {
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.errors as f64 / self.requests as f64).min(1.0)
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms / self.requests as f64
        }
    }
}

/// Increment applied by [`PartitionManager::update_partition_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestStats {
    pub requests: u64,
    pub errors: u64,
    pub latency: Duration,
}

impl RequestStats {
    pub fn single(latency: Duration, ok: bool) -> Self {
        Self {
            requests: 1,
            errors: u64::from(!ok),
            latency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub created_ms: u64,
    pub last_accessed_ms: u64,
    pub size: usize,
    pub health: f64,
    pub stats: PartitionStats,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl Partition {
    fn new(id: &str, domain: Option<String>, now_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            created_ms: now_ms,
            last_accessed_ms: now_ms,
            size: 0,
            health: 1.0,
            stats: PartitionStats::default(),
            domain,
            members: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionHealth {
    pub id: String,
    pub domain: Option<String>,
    pub size: usize,
    pub health: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub last_accessed_ms: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Idle partitions skipped because an operation still holds them.
    pub deferred: Vec<String>,
    pub purged: Vec<StoredEntry>,
    pub failures: Vec<ItemFailure>,
}

/// Whether `entry` is still the document that belonged to `partition` when
/// the partition was removed. Registering a document touches its partition,
/// so a member is never newer than the partition's last access; a document
/// re-added after removal is.
pub fn still_member(partition: &Partition, entry: &StoredEntry) -> bool {
    entry.partition_id == partition.id && entry.modified_ms <= partition.last_accessed_ms
}

/// Deletes the documents of a partition removed by cleanup.
#[async_trait]
pub trait MemberPurge: Send + Sync {
    /// Purge `key` if it is still a member of `partition`. `Ok(None)` when
    /// the key is gone or has since been re-added.
    async fn purge_member(
        &self,
        partition: &Partition,
        key: &str,
        actor: &str,
    ) -> Result<Option<StoredEntry>>;
}

#[async_trait]
impl MemberPurge for TieredStorage {
    async fn purge_member(
        &self,
        partition: &Partition,
        key: &str,
        actor: &str,
    ) -> Result<Option<StoredEntry>> {
        self.remove_if(key, actor, |entry| still_member(partition, entry))
            .await
    }
}

#[derive(Debug)]
struct PartitionState {
    record: Partition,
    in_flight: Arc<AtomicUsize>,
}

/// Marks a partition as in use; cleanup defers it until every guard drops.
#[derive(Debug)]
pub struct PartitionGuard {
    id: String,
    in_flight: Arc<AtomicUsize>,
}

impl PartitionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Weighted health in `[0, 1]`: error-free ratio, a latency score that is
/// 0.5 at the target latency, and exponential recency decay. Normalized by
/// the weight sum.
pub fn health_score(stats: &PartitionStats, idle: Duration, weights: &HealthWeights) -> f64 {
    let error_part = 1.0 - stats.error_rate();
    let target = weights.latency_target_ms.max(f64::EPSILON);
    let latency_part = if stats.requests == 0 {
        1.0
    } else {
        target / (target + stats.avg_latency_ms())
    };
    let half_life = weights.recency_half_life_secs.max(1) as f64;
    let recency_part = 0.5f64.powf(idle.as_secs_f64() / half_life);

    let total = weights.error_weight + weights.latency_weight + weights.recency_weight;
    if total <= 0.0 {
        return 0.0;
    }
    (weights.error_weight * error_part
        + weights.latency_weight * latency_part
        + weights.recency_weight * recency_part)
        / total
}

pub struct PartitionManager {
    config: PartitioningConfig,
    partitions: DashMap<String, PartitionState>,
    storage: Arc<TieredStorage>,
    vault: Arc<Vault>,
    clock: SharedClock,
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("path", &self.path)
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}

impl PartitionManager {
    /// Load `partitions.json` from `data_dir` and reconcile membership with
    /// what `storage` actually holds.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        config: &PartitioningConfig,
        storage: Arc<TieredStorage>,
        vault: Arc<Vault>,
        clock: SharedClock,
    ) -> Result<Self> {
        let path = data_dir.into().join(PARTITIONS_FILE);
        let saved: Vec<Partition> = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(saved) => saved,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable partition index");
                    Vec::new()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let manager = Self {
            config: config.clone(),
            partitions: DashMap::new(),
            storage,
            vault,
            clock,
            path,
            save_lock: Mutex::new(()),
        };
        for mut record in saved {
            record.members.clear();
            record.size = 0;
            manager.partitions.insert(record.id.clone(), PartitionState {
                record,
                in_flight: Arc::new(AtomicUsize::new(0)),
            });
        }
        for entry in manager.storage.entries() {
            let domain = manager.domain_of(&entry.metadata);
            let mut state = manager
                .partitions
                .entry(entry.partition_id.clone())
                .or_insert_with(|| PartitionState {
                    record: Partition::new(&entry.partition_id, domain, entry.created_ms),
                    in_flight: Arc::new(AtomicUsize::new(0)),
                });
            state.record.members.insert(entry.key.clone());
            state.record.size = state.record.members.len();
            state.record.last_accessed_ms = state.record.last_accessed_ms.max(entry.modified_ms);
        }
        debug!(partitions = manager.partitions.len(), "partition index loaded");
        Ok(manager)
    }

    fn domain_of(&self, metadata: &Metadata) -> Option<String> {
        metadata.get("domain").map(scalar_text)
    }

    /// Partition id for a document with `metadata` created at `created_ms`.
    ///
    /// Enabled strategies contribute `type:<t>`, `domain:<d>` and
    /// `month:<YYYY-MM>` components joined by `/`. Missing fields are
    /// skipped; with no components the document goes to `default`.
    pub fn assign(&self, metadata: &Metadata, created_ms: u64) -> String {
        let mut parts = Vec::new();
        if self.config.by_type
            && let Some(t) = metadata.get("type")
        {
            parts.push(format!("type:{}", slug(&scalar_text(t))));
        }
        if self.config.by_domain
            && let Some(d) = metadata.get("domain")
        {
            parts.push(format!("domain:{}", slug(&scalar_text(d))));
        }
        if self.config.by_time
            && let Some(month) = i64::try_from(created_ms)
                .ok()
                .and_then(DateTime::from_timestamp_millis)
        {
            parts.push(format!("month:{}", month.format("%Y-%m")));
        }
        if parts.is_empty() {
            DEFAULT_PARTITION.to_string()
        } else {
            parts.join("/")
        }
    }

    /// Add `key` to partition `id`, creating the partition on first use.
    pub fn register(&self, id: &str, key: &str, metadata: &Metadata) -> Result<()> {
        let now = self.clock.now_ms();
        let mut state = self
            .partitions
            .entry(id.to_string())
            .or_insert_with(|| PartitionState {
                record: Partition::new(id, self.domain_of(metadata), now),
                in_flight: Arc::new(AtomicUsize::new(0)),
            });
        let record = &mut state.record;
        if !record.members.contains(key)
            && let Some(limit) = self.config.max_documents_per_partition
            && record.members.len() >= limit
        {
            return Err(Error::CapacityExceeded {
                scope: format!("partition {id}"),
                limit,
            });
        }
        record.members.insert(key.to_string());
        record.size = record.members.len();
        record.last_accessed_ms = record.last_accessed_ms.max(now);
        Ok(())
    }

    pub fn unregister(&self, id: &str, key: &str) {
        if let Some(mut state) = self.partitions.get_mut(id) {
            state.record.members.remove(key);
            state.record.size = state.record.members.len();
        }
    }

    /// Mark partition `id` in use and touch its access time. `None` if the
    /// partition does not exist.
    pub fn acquire(&self, id: &str) -> Option<PartitionGuard> {
        let now = self.clock.now_ms();
        let mut state = self.partitions.get_mut(id)?;
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        state.record.last_accessed_ms = state.record.last_accessed_ms.max(now);
        Some(PartitionGuard {
            id: id.to_string(),
            in_flight: Arc::clone(&state.in_flight),
        })
    }

    pub fn touch(&self, id: &str) {
        let now = self.clock.now_ms();
        if let Some(mut state) = self.partitions.get_mut(id) {
            state.record.last_accessed_ms = state.record.last_accessed_ms.max(now);
        }
    }

    /// Fold `stats` into partition `id` and recompute its health.
    pub fn update_partition_stats(&self, id: &str, stats: RequestStats) -> Result<f64> {
        let now = self.clock.now_ms();
        let mut state = self
            .partitions
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("partition {id}")))?;
        let record = &mut state.record;
        record.stats.requests += stats.requests;
        record.stats.errors += stats.errors;
        record.stats.total_latency_ms += stats.latency.as_secs_f64() * 1000.0;
        let idle = Duration::from_millis(now.saturating_sub(record.last_accessed_ms));
        record.health = health_score(&record.stats, idle, &self.config.health);
        Ok(record.health)
    }

    pub fn get(&self, id: &str) -> Option<Partition> {
        self.partitions.get(id).map(|s| s.record.clone())
    }

    /// Ids of partitions whose documents carry one of `domains`.
    pub fn ids_for_domains(&self, domains: &[String]) -> BTreeSet<String> {
        self.partitions
            .iter()
            .filter(|s| {
                s.record
                    .domain
                    .as_ref()
                    .is_some_and(|d| domains.iter().any(|want| want == d))
            })
            .map(|s| s.key().clone())
            .collect()
    }

    /// Health of every partition, with recency evaluated now.
    pub fn health(&self) -> Vec<PartitionHealth> {
        let now = self.clock.now_ms();
        let mut out: Vec<PartitionHealth> = self
            .partitions
            .iter()
            .map(|s| {
                let r = &s.record;
                let idle = Duration::from_millis(now.saturating_sub(r.last_accessed_ms));
                PartitionHealth {
                    id: r.id.clone(),
                    domain: r.domain.clone(),
                    size: r.size,
                    health: health_score(&r.stats, idle, &self.config.health),
                    error_rate: r.stats.error_rate(),
                    avg_latency_ms: r.stats.avg_latency_ms(),
                    last_accessed_ms: r.last_accessed_ms,
                    in_flight: s.in_flight.load(Ordering::Acquire),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Remove partitions idle for longer than `threshold` and hand each
    /// member to `purge`. Partitions held by a [`PartitionGuard`] are
    /// reported as deferred; this never waits for them.
    pub async fn cleanup_inactive_partitions(
        &self,
        threshold: Duration,
        actor: &str,
        purge: &dyn MemberPurge,
    ) -> Result<CleanupReport> {
        let now = self.clock.now_ms();
        let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        let is_idle = |state: &PartitionState| {
            now.saturating_sub(state.record.last_accessed_ms) > threshold_ms
        };

        let idle: Vec<String> = self
            .partitions
            .iter()
            .filter(|s| is_idle(s.value()))
            .map(|s| s.key().clone())
            .collect();

        let mut report = CleanupReport::default();
        for id in idle {
            let removed = self.partitions.remove_if(&id, |_, state| {
                state.in_flight.load(Ordering::Acquire) == 0 && is_idle(state)
            });
            let Some((id, state)) = removed else {
                if self.partitions.contains_key(&id) {
                    debug!(partition = %id, "partition in use, deferring cleanup");
                    report.deferred.push(id);
                }
                continue;
            };

            let mut purged = 0usize;
            let mut failed = 0usize;
            for key in &state.record.members {
                match purge.purge_member(&state.record, key, actor).await {
                    Ok(Some(entry)) => {
                        purged += 1;
                        report.purged.push(entry);
                    },
                    Ok(None) => {
                        debug!(partition = %id, key = %key, "member re-added since removal, kept");
                    },
                    Err(e) => {
                        failed += 1;
                        warn!(partition = %id, key = %key, error = %e, "failed to purge document");
                        report.failures.push(ItemFailure::new(key.clone(), e));
                    },
                }
            }
            self.vault
                .record_best_effort(
                    AuditAction::PartitionCleanup,
                    actor,
                    &id,
                    json!({
                        "idle_ms": now.saturating_sub(state.record.last_accessed_ms),
                        "documents_purged": purged,
                        "failures": failed,
                    }),
                )
                .await;
            info!(partition = %id, purged, failed, "removed inactive partition");
            report.removed.push(id);
        }

        if !report.removed.is_empty() {
            self.save().await?;
        }
        Ok(report)
    }

    /// Write the partition index to `partitions.json`.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let mut records: Vec<Partition> = self
            .partitions
            .iter()
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let bytes = serde_json::to_vec_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), partitions = records.len(), "partition index saved");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn slug(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
