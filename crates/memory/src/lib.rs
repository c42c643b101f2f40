//! Context memory: documents → sanitized, encrypted and chunked → embedded
//! → tiered on disk, cached in front and grouped into partitions.

pub mod cache;
pub mod capability;
pub mod chunker;
pub mod embeddings;
pub mod engine;
pub mod maintenance;
pub mod partition;
pub mod profiler;
pub mod schema;
pub mod tiers;
pub mod vector;

pub use {
    cache::{CacheStats, CachingManager},
    capability::{Capability, CapabilityKind},
    chunker::Chunker,
    embeddings::{EmbeddingProvider, HashingEmbedder},
    engine::{HealthStats, MaintenanceReport, MemoryEngine, MemoryEngineBuilder},
    maintenance::MaintenanceTask,
    partition::{CleanupReport, MemberPurge, PartitionHealth, PartitionManager},
    profiler::ProfilerStats,
    schema::{Chunk, ContextDocument, Document, Tier},
    tiers::{MigrationReport, TieredStorage},
    vector::{InMemoryVectorIndex, VectorHit, VectorIndex},
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::{path::Path, sync::Arc};

    use {
        mnemo_common::SharedClock,
        mnemo_vault::{KeySource, MasterKey, Vault, cipher::generate_key},
    };

    pub async fn test_vault(dir: &Path, clock: SharedClock) -> Arc<Vault> {
        match Vault::with_key(
            MasterKey::from_bytes(generate_key()),
            KeySource::Explicit,
            dir.join("audit.log"),
            clock,
        )
        .await
        {
            Ok(vault) => Arc::new(vault),
            Err(e) => panic!("failed to open test vault: {e}"),
        }
    }
}
