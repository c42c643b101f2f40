//! Configuration schema. Every section defaults, so an empty file is valid.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Static configuration for a memory engine instance, loaded once at
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryEngineConfig {
    pub storage: StorageConfig,
    pub tiers: TierConfig,
    pub cache: CacheConfig,
    pub chunking: ChunkingConfig,
    pub partitioning: PartitioningConfig,
    pub security: SecurityConfig,
    pub pii_scan: PiiScanConfig,
    pub retrieval: RetrievalConfig,
    pub maintenance: MaintenanceConfig,
}

impl MemoryEngineConfig {
    /// Defaults rooted at `data_dir`, handy for tests and embedding.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for tier directories, L2 cache, audit log and key material.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    /// `None` keeps cold storage unbounded (archival retention).
    pub cold_capacity: Option<usize>,
    /// HOT documents idle longer than this are demoted to WARM.
    pub hot_idle_secs: u64,
    /// WARM documents idle longer than this are demoted to COLD.
    pub warm_idle_secs: u64,
    /// A WARM/COLD document accessed more than this many times inside the
    /// promotion window moves one tier up.
    pub promotion_access_threshold: u32,
    pub promotion_window_secs: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 1_000,
            warm_capacity: 10_000,
            cold_capacity: None,
            hot_idle_secs: 60 * 60,
            warm_idle_secs: 24 * 60 * 60,
            promotion_access_threshold: 3,
            promotion_window_secs: 60 * 60,
        }
    }
}

impl TierConfig {
    pub fn hot_idle(&self) -> Duration {
        Duration::from_secs(self.hot_idle_secs)
    }

    pub fn warm_idle(&self) -> Duration {
        Duration::from_secs(self.warm_idle_secs)
    }

    pub fn promotion_window(&self) -> Duration {
        Duration::from_secs(self.promotion_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 256,
            l2_capacity: 4_096,
            default_ttl_secs: 15 * 60,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size in whitespace-separated words.
    pub window_size_words: usize,
    /// Words shared between consecutive windows.
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size_words: 400,
            overlap_words: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitioningConfig {
    pub by_type: bool,
    pub by_domain: bool,
    pub by_time: bool,
    /// Hard document limit per partition; ingest fails past it.
    pub max_documents_per_partition: Option<usize>,
    /// Idle time after which background cleanup removes a partition.
    /// `None` disables background cleanup.
    pub inactive_after_secs: Option<u64>,
    pub health: HealthWeights,
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        Self {
            by_type: true,
            by_domain: true,
            by_time: false,
            max_documents_per_partition: None,
            inactive_after_secs: None,
            health: HealthWeights::default(),
        }
    }
}

/// Weights and scales for the partition health score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub error_weight: f64,
    pub latency_weight: f64,
    pub recency_weight: f64,
    /// Average response time that scores 0.5 on the latency component.
    pub latency_target_ms: f64,
    /// Idle time that halves the recency component.
    pub recency_half_life_secs: u64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            error_weight: 0.5,
            latency_weight: 0.3,
            recency_weight: 0.2,
            latency_target_ms: 100.0,
            recency_half_life_secs: 24 * 60 * 60,
        }
    }
}

/// What ingest does with a document that contains PII.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiPolicy {
    /// Store it and record the flag.
    #[default]
    Flag,
    /// Refuse to store it.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Secret looked up in the external secrets provider, when one is wired.
    pub secret_name: String,
    /// Environment variable holding a base64 encoded 32-byte key.
    pub key_env_var: String,
    /// Local key file; defaults to `<data_dir>/keys/master.key`.
    pub key_file: Option<PathBuf>,
    pub pii_policy: PiiPolicy,
    pub sanitize_input: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_name: "mnemo/master-key".into(),
            key_env_var: "MNEMO_ENCRYPTION_KEY".into(),
            key_file: None,
            pii_policy: PiiPolicy::Flag,
            sanitize_input: true,
        }
    }
}

/// Metadata pre-filter applied before any document is decrypted for a PII
/// scan. Empty lists match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiiScanConfig {
    /// Only scan documents whose `type` metadata is in this list.
    pub types: Vec<String>,
    /// Only scan documents whose `domain` metadata is in this list.
    pub domains: Vec<String>,
    /// Only scan documents modified within this many days.
    pub modified_within_days: Option<u64>,
    /// Report documents flagged at ingest without decrypting them.
    pub trust_ingest_flags: bool,
}

impl Default for PiiScanConfig {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            domains: Vec::new(),
            modified_within_days: None,
            trust_ingest_flags: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub default_similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            default_similarity_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
