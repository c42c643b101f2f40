//! The memory engine: ingest, retrieval, deletion and scanning over the
//! cache, tier storage, partitions, vector index and vault.
//!
//! Every operation on a document key runs under that key's engine lock, which
//! is always taken before the storage or cache lock for the same key.
//! Operations on different keys never wait on each other.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    mnemo_common::{
        Error, KeyLocks, Metadata, Result, SharedClock, SystemClock, first_non_scalar,
    },
    mnemo_config::{MemoryEngineConfig, PiiPolicy},
    mnemo_vault::{
        AuditAction, KeySource, MasterKey, PiiCorpus, PiiScanFilter, PiiScanReport, SYSTEM_ACTOR,
        SecretsProvider, Vault, find_pii, keys::verify_fingerprint,
    },
    serde::Serialize,
    serde_json::{Value, json},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    uuid::Uuid,
};

use crate::{
    cache::{CacheStats, CachingManager},
    capability::{Capability, CapabilityKind},
    chunker::Chunker,
    embeddings::{EmbeddingProvider, HashingEmbedder},
    partition::{
        CleanupReport, MemberPurge, Partition, PartitionHealth, PartitionManager, RequestStats,
        still_member,
    },
    profiler::{Profiler, ProfilerStats},
    schema::{Chunk, ContextDocument, Document, Tier, chunk_vector_id},
    tiers::{MigrationReport, RemoveOutcome, StoredEntry, TierStats, TieredStorage},
    vector::{InMemoryVectorIndex, VectorHit, VectorIndex, metadata_matches},
};

/// Chunk metadata fields the engine adds next to the document's own.
pub const DOC_KEY_FIELD: &str = "_doc_key";
pub const PARTITION_FIELD: &str = "_partition";
pub const CHUNK_INDEX_FIELD: &str = "_chunk";

/// Initial chunks fetched per requested document; several chunks of one
/// document can occupy the top of the ranking.
const CANDIDATE_FACTOR: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub documents: usize,
    pub tiers: TierStats,
    pub partitions: Vec<PartitionHealth>,
    pub cache: CacheStats,
    pub vector_entries: usize,
    pub key_fingerprint: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub migration: MigrationReport,
    pub expired_cache_entries: usize,
    pub cleanup: Option<CleanupReport>,
    pub pruned_locks: usize,
}

pub struct MemoryEngineBuilder {
    config: MemoryEngineConfig,
    clock: Option<SharedClock>,
    secrets: Option<Arc<dyn SecretsProvider>>,
    master_key: Option<MasterKey>,
    vectors: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl MemoryEngineBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn secrets_provider(mut self, provider: Arc<dyn SecretsProvider>) -> Self {
        self.secrets = Some(provider);
        self
    }

    /// Use this key instead of resolving one from the configured sources.
    pub fn master_key(mut self, key: MasterKey) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vectors = Some(index);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn build(self) -> Result<MemoryEngine> {
        mnemo_config::validate(&self.config)?;
        let chunker = Chunker::from_config(&self.config.chunking)?;
        let data_dir = self.config.storage.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);

        let vault = Arc::new(match self.master_key {
            Some(key) => {
                verify_fingerprint(&key, &data_dir).await?;
                Vault::with_key(key, KeySource::Explicit, data_dir.join("audit.log"), clock.clone())
                    .await?
            },
            None => {
                Vault::open(&data_dir, &self.config.security, self.secrets.as_deref(), clock.clone())
                    .await?
            },
        });

        let storage = Arc::new(
            TieredStorage::open(&data_dir, &self.config.tiers, Arc::clone(&vault), clock.clone())
                .await?,
        );
        let cache = Arc::new(
            CachingManager::open(
                data_dir.join("cache"),
                &self.config.cache,
                Arc::clone(&vault),
                clock.clone(),
            )
            .await?,
        );
        let partitions = Arc::new(
            PartitionManager::open(
                &data_dir,
                &self.config.partitioning,
                Arc::clone(&storage),
                Arc::clone(&vault),
                clock.clone(),
            )
            .await?,
        );
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashingEmbedder::default()));
        let vectors = match self.vectors {
            Some(vectors) => vectors,
            None => {
                let vectors: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
                reindex(&storage, &vault, vectors.as_ref(), embedder.as_ref(), &chunker).await?;
                vectors
            },
        };

        info!(
            data_dir = %data_dir.display(),
            documents = storage.len(),
            partitions = partitions.len(),
            embedding_model = embedder.model_name(),
            "memory engine ready"
        );
        Ok(MemoryEngine {
            config: self.config,
            clock,
            vault,
            chunker,
            cache,
            storage,
            partitions,
            vectors,
            embedder,
            locks: KeyLocks::new(),
            profiler: Profiler::new(),
        })
    }
}

/// Rebuild a fresh in-memory vector index from persisted documents. Reads
/// here do not count as accesses.
async fn reindex(
    storage: &TieredStorage,
    vault: &Vault,
    vectors: &dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    chunker: &Chunker,
) -> Result<()> {
    if storage.is_empty() {
        return Ok(());
    }
    let mut indexed = 0usize;
    for entry in storage.entries() {
        let text = match storage.load_payload(&entry.key).await {
            Ok(payload) => open_content(vault, &entry.key, payload.bytes, payload.encrypted),
            Err(e) => Err(e),
        };
        let text = match text {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "skipping unreadable document during reindex");
                continue;
            },
        };
        let chunks = chunker.chunk(&entry.key, &text);
        index_chunks(vectors, embedder, &entry.partition_id, &entry.metadata, &chunks).await?;
        indexed += 1;
    }
    info!(documents = indexed, "rebuilt vector index from storage");
    Ok(())
}

fn open_content(vault: &Vault, key: &str, bytes: Vec<u8>, encrypted: bool) -> Result<String> {
    let bytes = if encrypted {
        vault.decrypt(&bytes, key)?
    } else {
        bytes
    };
    String::from_utf8(bytes).map_err(|_| Error::integrity(key, "content is not valid UTF-8"))
}

async fn index_chunks(
    vectors: &dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    partition_id: &str,
    metadata: &Metadata,
    chunks: &[Chunk],
) -> Result<()> {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder.embed_batch(&texts).await?;
    if embeddings.len() != chunks.len() {
        return Err(anyhow::anyhow!(
            "embedder returned {} vectors for {} chunks",
            embeddings.len(),
            chunks.len()
        )
        .into());
    }
    for (chunk, embedding) in chunks.iter().zip(embeddings) {
        let mut chunk_metadata = metadata.clone();
        chunk_metadata.insert(DOC_KEY_FIELD.into(), json!(chunk.parent_key));
        chunk_metadata.insert(PARTITION_FIELD.into(), json!(partition_id));
        chunk_metadata.insert(CHUNK_INDEX_FIELD.into(), json!(chunk.index));
        vectors
            .index(&chunk.vector_id(), embedding, chunk_metadata)
            .await?;
    }
    Ok(())
}

/// Best score per document, highest first.
fn rank_hits(
    hits: impl IntoIterator<Item = VectorHit>,
    threshold: f32,
    allowed_partitions: Option<&BTreeSet<String>>,
) -> Vec<(String, f32)> {
    let mut best: HashMap<String, f32> = HashMap::new();
    for hit in hits {
        if hit.score < threshold {
            continue;
        }
        if let Some(allowed) = allowed_partitions
            && !hit
                .metadata
                .get(PARTITION_FIELD)
                .and_then(Value::as_str)
                .is_some_and(|p| allowed.contains(p))
        {
            continue;
        }
        let key = match hit.metadata.get(DOC_KEY_FIELD).and_then(Value::as_str) {
            Some(key) => key.to_string(),
            None => hit
                .key
                .rsplit_once('#')
                .map_or_else(|| hit.key.clone(), |(key, _)| key.to_string()),
        };
        let slot = best.entry(key).or_insert(f32::MIN);
        *slot = slot.max(hit.score);
    }
    let mut ranked: Vec<(String, f32)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

pub struct MemoryEngine {
    config: MemoryEngineConfig,
    clock: SharedClock,
    vault: Arc<Vault>,
    chunker: Chunker,
    cache: Arc<CachingManager>,
    storage: Arc<TieredStorage>,
    partitions: Arc<PartitionManager>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    locks: KeyLocks,
    profiler: Profiler,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("data_dir", &self.config.storage.data_dir)
            .field("vault", &self.vault)
            .field("storage", &self.storage)
            .field("embedding_model", &self.embedder.model_name())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    pub fn builder(config: MemoryEngineConfig) -> MemoryEngineBuilder {
        MemoryEngineBuilder {
            config,
            clock: None,
            secrets: None,
            master_key: None,
            vectors: None,
            embedder: None,
        }
    }

    /// Build with defaults for every collaborator.
    pub async fn open(config: MemoryEngineConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &MemoryEngineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.storage.data_dir
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn storage(&self) -> &TieredStorage {
        &self.storage
    }

    pub fn cache(&self) -> &CachingManager {
        &self.cache
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    pub fn capability(&self, kind: CapabilityKind) -> Capability<'_> {
        match kind {
            CapabilityKind::Cache => Capability::Cache(&self.cache),
            CapabilityKind::Storage => Capability::Storage(&self.storage),
            CapabilityKind::Security => Capability::Security(&self.vault),
            CapabilityKind::Chunking => Capability::Chunking(&self.chunker),
            CapabilityKind::Partition => Capability::Partition(&self.partitions),
        }
    }

    /// Sanitize, PII-check, encrypt, chunk, index and persist a document.
    ///
    /// The key comes from the `key` metadata field when present, otherwise a
    /// fresh UUID. Re-adding an existing key replaces the document. Under
    /// [`PiiPolicy::Reject`] a document containing PII fails with
    /// `PolicyViolation` and nothing is stored.
    pub async fn add_document(&self, content: &str, metadata: Metadata, user: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.add_document_inner(content, metadata, user).await;
        self.profiler
            .record("add_document", started.elapsed(), result.is_ok());
        result
    }

    async fn add_document_inner(&self, content: &str, metadata: Metadata, user: &str) -> Result<String> {
        if let Some(field) = first_non_scalar(&metadata) {
            return Err(Error::InvalidInput(format!(
                "metadata field `{field}` must be a scalar"
            )));
        }
        let key = match metadata.get("key") {
            None => Uuid::new_v4().to_string(),
            Some(Value::String(key)) if !key.trim().is_empty() => key.clone(),
            Some(_) => {
                return Err(Error::InvalidInput(
                    "metadata `key` must be a non-empty string".into(),
                ));
            },
        };

        let text = if self.config.security.sanitize_input {
            self.vault.sanitize(content)
        } else {
            content.to_string()
        };
        let pii = find_pii(&text);
        let kinds: Vec<String> = pii.iter().map(ToString::to_string).collect();
        if !pii.is_empty() && self.config.security.pii_policy == PiiPolicy::Reject {
            self.vault
                .record(AuditAction::PiiRejected, user, &key, json!({ "kinds": kinds }))
                .await?;
            warn!(key = %key, user, kinds = ?kinds, "rejected document containing PII");
            return Err(Error::PolicyViolation(format!(
                "document {key} contains PII ({})",
                kinds.join(", ")
            )));
        }

        let _guard = self.locks.lock(&key).await;
        let now = self.clock.now_ms();
        let previous = self.storage.entry(&key);
        let created_ms = previous.as_ref().map_or(now, |p| p.created_ms);
        let partition_id = self.partitions.assign(&metadata, created_ms);
        let moved_partition = previous
            .as_ref()
            .is_some_and(|p| p.partition_id != partition_id);
        self.partitions.register(&partition_id, &key, &metadata)?;
        let _partition = self.partitions.acquire(&partition_id);

        let sealed = self.vault.encrypt(text.as_bytes(), &key)?;
        let chunks = self.chunker.chunk(&key, &text);
        let doc = Document {
            key: key.clone(),
            content: sealed,
            metadata,
            owner: user.to_string(),
            created_ms,
            modified_ms: now,
            partition_id: partition_id.clone(),
            tier: Tier::Hot,
            encrypted: true,
            pii_flagged: !pii.is_empty(),
            chunk_count: chunks.len(),
        };

        let started = Instant::now();
        let result = self.index_and_store(doc, &chunks, previous.as_ref()).await;
        self.record_partition(&partition_id, started.elapsed(), result.is_ok());
        if let Err(e) = result {
            if previous.is_none() || moved_partition {
                self.partitions.unregister(&partition_id, &key);
            }
            return Err(e);
        }

        if let Some(previous) = previous.as_ref().filter(|_| moved_partition) {
            self.partitions.unregister(&previous.partition_id, &key);
        }
        self.cache.invalidate(&key).await;

        self.vault
            .record(
                AuditAction::Encrypt,
                user,
                &key,
                json!({ "partition": partition_id, "chunks": chunks.len() }),
            )
            .await?;
        if !pii.is_empty() {
            self.vault
                .record(AuditAction::PiiFlagged, user, &key, json!({ "kinds": kinds }))
                .await?;
        }
        info!(
            key = %key,
            user,
            partition = %partition_id,
            chunks = chunks.len(),
            pii = !pii.is_empty(),
            "document added"
        );
        Ok(key)
    }

    async fn index_and_store(
        &self,
        doc: Document,
        chunks: &[Chunk],
        previous: Option<&StoredEntry>,
    ) -> Result<()> {
        index_chunks(
            self.vectors.as_ref(),
            self.embedder.as_ref(),
            &doc.partition_id,
            &doc.metadata,
            chunks,
        )
        .await?;
        if let Some(previous) = previous {
            for stale in chunks.len()..previous.chunk_count {
                self.vectors
                    .delete(&chunk_vector_id(&doc.key, stale))
                    .await?;
            }
        }

        let key = doc.key.clone();
        if let Err(e) = self.storage.store(doc).await {
            match previous {
                None => {
                    for chunk in chunks {
                        if let Err(cleanup) = self.vectors.delete(&chunk.vector_id()).await {
                            warn!(key = %key, error = %cleanup, "failed to roll back chunk");
                        }
                    }
                },
                Some(previous) => {
                    if let Err(restore) = self.restore_chunks(previous, chunks.len()).await {
                        error!(key = %key, error = %restore, "failed to restore index of replaced document");
                    }
                },
            }
            return Err(e);
        }
        Ok(())
    }

    /// Re-index the stored version of `previous` after a failed replace
    /// left `new_count` chunks of the rejected version in the index.
    async fn restore_chunks(&self, previous: &StoredEntry, new_count: usize) -> Result<()> {
        let payload = self.storage.load_payload(&previous.key).await?;
        let text = open_content(&self.vault, &previous.key, payload.bytes, payload.encrypted)?;
        let chunks = self.chunker.chunk(&previous.key, &text);
        index_chunks(
            self.vectors.as_ref(),
            self.embedder.as_ref(),
            &previous.partition_id,
            &previous.metadata,
            &chunks,
        )
        .await?;
        for extra in chunks.len()..new_count {
            self.vectors
                .delete(&chunk_vector_id(&previous.key, extra))
                .await?;
        }
        debug!(key = %previous.key, chunks = chunks.len(), "restored index of replaced document");
        Ok(())
    }

    /// Top `k` documents for `query` (`retrieval.default_k` when `None`),
    /// best first. Candidates scoring below `similarity_threshold` (the
    /// configured default when `None`) or not matching every `filters` pair
    /// are left out, as are documents that fail integrity checks.
    pub async fn get_context(
        &self,
        query: &str,
        k: Option<usize>,
        user: &str,
        filters: &Metadata,
        similarity_threshold: Option<f32>,
    ) -> Result<Vec<ContextDocument>> {
        let started = Instant::now();
        let k = k.unwrap_or(self.config.retrieval.default_k);
        let result = self
            .get_context_inner(query, k, user, filters, similarity_threshold)
            .await;
        self.profiler
            .record("get_context", started.elapsed(), result.is_ok());
        result
    }

    async fn get_context_inner(
        &self,
        query: &str,
        k: usize,
        user: &str,
        filters: &Metadata,
        similarity_threshold: Option<f32>,
    ) -> Result<Vec<ContextDocument>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let threshold =
            similarity_threshold.unwrap_or(self.config.retrieval.default_similarity_threshold);
        let embedding = self.embedder.embed(query).await?;
        let ranked = self
            .search_documents(&embedding, k, std::slice::from_ref(filters), threshold, None)
            .await?;
        debug!(user, k, candidates = ranked.len(), "similarity search complete");
        self.load_ranked(ranked, k, user, |doc| metadata_matches(&doc.metadata, filters))
            .await
    }

    /// Direct lookup, cache first. Missing keys and documents that fail
    /// integrity checks are left out; order follows `keys`.
    pub async fn get_context_by_keys<I, S>(&self, keys: I) -> Result<Vec<ContextDocument>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let started = Instant::now();
        let result = self.get_context_by_keys_inner(keys).await;
        self.profiler
            .record("get_context_by_keys", started.elapsed(), result.is_ok());
        result
    }

    async fn get_context_by_keys_inner<I, S>(&self, keys: I) -> Result<Vec<ContextDocument>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            let key = key.as_ref();
            if !seen.insert(key.to_string()) {
                continue;
            }
            match self.load_document(key, SYSTEM_ACTOR).await {
                Ok(Some(doc)) => out.push(doc),
                Ok(None) => {},
                Err(e) if e.is_integrity() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Similarity search restricted to documents in partitions for
    /// `domains`. No score threshold applies.
    pub async fn get_context_by_domains(
        &self,
        domains: &[&str],
        query: &str,
        max_results: usize,
    ) -> Result<Vec<ContextDocument>> {
        let started = Instant::now();
        let result = self
            .get_context_by_domains_inner(domains, query, max_results)
            .await;
        self.profiler
            .record("get_context_by_domains", started.elapsed(), result.is_ok());
        result
    }

    async fn get_context_by_domains_inner(
        &self,
        domains: &[&str],
        query: &str,
        max_results: usize,
    ) -> Result<Vec<ContextDocument>> {
        if max_results == 0 || domains.is_empty() {
            return Ok(Vec::new());
        }
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let embedding = self.embedder.embed(query).await?;

        let filter_sets: Vec<Metadata> = domains
            .iter()
            .map(|domain| {
                let mut filters = Metadata::new();
                filters.insert("domain".into(), json!(domain));
                filters
            })
            .collect();
        let allowed = self
            .config
            .partitioning
            .by_domain
            .then(|| self.partitions.ids_for_domains(&domains));
        let ranked = self
            .search_documents(&embedding, max_results, &filter_sets, f32::MIN, allowed.as_ref())
            .await?;
        self.load_ranked(ranked, max_results, SYSTEM_ACTOR, |doc| {
            doc.metadata
                .get("domain")
                .and_then(Value::as_str)
                .is_some_and(|d| domains.iter().any(|want| want == d))
        })
        .await
    }

    /// Rank documents by their best chunk, searching once per filter set.
    /// The chunk window starts at `CANDIDATE_FACTOR` per wanted document and
    /// doubles until `wanted` distinct documents rank, the index runs out of
    /// matching chunks or the lowest hit falls below `threshold`.
    async fn search_documents(
        &self,
        embedding: &[f32],
        wanted: usize,
        filter_sets: &[Metadata],
        threshold: f32,
        allowed: Option<&BTreeSet<String>>,
    ) -> Result<Vec<(String, f32)>> {
        let mut window = wanted.saturating_mul(CANDIDATE_FACTOR).max(1);
        loop {
            let mut hits = Vec::new();
            let mut exhausted = true;
            let mut below_threshold = true;
            for filters in filter_sets {
                let found = self
                    .vectors
                    .similarity_search(embedding, window, filters)
                    .await?;
                if found.len() >= window {
                    exhausted = false;
                    below_threshold &= found.last().is_some_and(|hit| hit.score < threshold);
                }
                hits.extend(found);
            }
            let ranked = rank_hits(hits, threshold, allowed);
            if ranked.len() >= wanted || exhausted || below_threshold || window == usize::MAX {
                return Ok(ranked);
            }
            debug!(window, ranked = ranked.len(), wanted, "widening candidate search");
            window = window.saturating_mul(2);
        }
    }

    async fn load_ranked(
        &self,
        ranked: Vec<(String, f32)>,
        limit: usize,
        actor: &str,
        accept: impl Fn(&ContextDocument) -> bool,
    ) -> Result<Vec<ContextDocument>> {
        let mut out = Vec::with_capacity(limit.min(ranked.len()));
        for (key, score) in ranked {
            if out.len() >= limit {
                break;
            }
            match self.load_document(&key, actor).await {
                Ok(Some(mut doc)) if accept(&doc) => {
                    doc.score = Some(score);
                    out.push(doc);
                },
                Ok(_) => {},
                Err(e) if e.is_integrity() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Cache first, then storage; a storage read populates the cache. Both
    /// paths count as an access for tier promotion.
    /// `Ok(None)` when the key does not exist. Integrity failures are
    /// audited before being returned.
    async fn load_document(&self, key: &str, actor: &str) -> Result<Option<ContextDocument>> {
        let _guard = self.locks.lock(key).await;

        if let Some(bytes) = self.cache.get(key).await {
            match serde_json::from_slice::<ContextDocument>(&bytes) {
                Ok(doc) if self.storage.record_access(key).await => {
                    self.partitions.touch(&doc.partition_id);
                    return Ok(Some(doc));
                },
                Ok(_) => {
                    debug!(key, "dropping cache entry for a document no longer stored");
                    self.cache.invalidate(key).await;
                    return Ok(None);
                },
                Err(e) => {
                    warn!(key, error = %e, "discarding undecodable cache entry");
                    self.cache.invalidate(key).await;
                },
            }
        }

        let Some(entry) = self.storage.entry(key) else {
            return Ok(None);
        };
        let _partition = self.partitions.acquire(&entry.partition_id);
        let started = Instant::now();
        let result = self.read_through(key).await;
        self.record_partition(&entry.partition_id, started.elapsed(), result.is_ok());

        match result {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                if e.is_integrity() {
                    error!(key, error = %e, "document failed integrity check");
                    self.vault
                        .record_best_effort(
                            AuditAction::IntegrityFailure,
                            actor,
                            key,
                            json!({ "during": "read", "error": e.to_string() }),
                        )
                        .await;
                }
                Err(e)
            },
        }
    }

    async fn read_through(&self, key: &str) -> Result<ContextDocument> {
        let doc = self.storage.get(key).await?;
        let content = open_content(&self.vault, &doc.key, doc.content, doc.encrypted)?;
        let context = ContextDocument {
            key: doc.key,
            content,
            metadata: doc.metadata,
            partition_id: doc.partition_id,
            created_ms: doc.created_ms,
            modified_ms: doc.modified_ms,
            score: None,
        };
        self.cache
            .put(key, serde_json::to_vec(&context)?, None)
            .await;
        Ok(context)
    }

    fn record_partition(&self, partition_id: &str, elapsed: Duration, ok: bool) {
        if let Err(e) = self
            .partitions
            .update_partition_stats(partition_id, RequestStats::single(elapsed, ok))
        {
            debug!(partition = partition_id, error = %e, "partition stats not recorded");
        }
    }

    /// Remove `key` from the vector index, every cache level and every tier.
    ///
    /// Deleting an already-deleted key succeeds; only a key that never
    /// existed is `NotFound`. Every attempt is audited.
    pub async fn secure_delete(&self, key: &str, user: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.secure_delete_inner(key, user).await;
        self.profiler
            .record("secure_delete", started.elapsed(), result.is_ok());
        result
    }

    async fn secure_delete_inner(&self, key: &str, user: &str) -> Result<()> {
        let _guard = self.locks.lock(key).await;
        let entry = self.storage.entry(key);
        if entry.is_none() && !self.storage.was_deleted(key) {
            return Err(Error::not_found(key));
        }

        if let Some(entry) = &entry
            && let Err(e) = self.delete_chunks(key, entry.chunk_count).await
        {
            error!(key, error = %e, "failed to remove document from vector index");
            self.vault
                .record_best_effort(
                    AuditAction::SecureDelete,
                    user,
                    key,
                    json!({ "status": "failed", "stage": "vector_index", "error": e.to_string() }),
                )
                .await;
            return Err(e);
        }
        self.cache.invalidate(key).await;

        match self.storage.remove(key, user).await? {
            RemoveOutcome::Removed(entry) => {
                self.partitions.unregister(&entry.partition_id, key);
                info!(key, user, "document securely deleted");
                Ok(())
            },
            RemoveOutcome::AlreadyDeleted => {
                debug!(key, user, "document was already deleted");
                Ok(())
            },
            RemoveOutcome::NeverExisted => Err(Error::not_found(key)),
        }
    }

    async fn delete_chunks(&self, key: &str, chunk_count: usize) -> Result<()> {
        for index in 0..chunk_count {
            self.vectors.delete(&chunk_vector_id(key, index)).await?;
        }
        Ok(())
    }

    /// Scan every stored document for PII using the configured pre-filter.
    /// Flagged keys are in `report.flagged`.
    pub async fn scan_for_pii(&self, user: &str) -> Result<PiiScanReport> {
        let filter = PiiScanFilter::from_config(&self.config.pii_scan, self.clock.now_ms());
        self.scan_for_pii_with(user, &filter, &CancellationToken::new())
            .await
    }

    pub async fn scan_for_pii_with(
        &self,
        user: &str,
        filter: &PiiScanFilter,
        cancel: &CancellationToken,
    ) -> Result<PiiScanReport> {
        let started = Instant::now();
        let result = self
            .vault
            .scan_for_pii(self.storage.as_ref(), filter, user, cancel)
            .await;
        self.profiler
            .record("scan_for_pii", started.elapsed(), result.is_ok());
        result
    }

    pub async fn migrate(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let started = Instant::now();
        let result = self.storage.migrate(cancel).await;
        self.profiler
            .record("migrate", started.elapsed(), result.is_ok());
        result
    }

    /// Remove partitions idle for longer than `threshold` and everything
    /// derived from their documents.
    pub async fn cleanup_inactive_partitions(
        &self,
        threshold: Duration,
        actor: &str,
    ) -> Result<CleanupReport> {
        let started = Instant::now();
        let result = self
            .partitions
            .cleanup_inactive_partitions(threshold, actor, self)
            .await;
        self.profiler
            .record("cleanup_inactive_partitions", started.elapsed(), result.is_ok());
        result
    }

    /// Persist the partition index.
    pub async fn flush(&self) -> Result<()> {
        self.partitions.save().await
    }

    /// One maintenance pass: migrate, sweep the cache, clean up inactive
    /// partitions when configured, persist partitions and drop idle locks.
    /// Fails with [`Error::Cancelled`] when `cancel` fired before the pass
    /// started; a pass cancelled midway returns what it did so far.
    pub async fn run_maintenance(&self, cancel: &CancellationToken) -> Result<MaintenanceReport> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut report = MaintenanceReport {
            migration: self.migrate(cancel).await?,
            ..MaintenanceReport::default()
        };
        if cancel.is_cancelled() {
            return Ok(report);
        }
        report.expired_cache_entries = self.cache.sweep_expired().await;
        if let Some(secs) = self.config.partitioning.inactive_after_secs {
            report.cleanup = Some(
                self.cleanup_inactive_partitions(Duration::from_secs(secs), SYSTEM_ACTOR)
                    .await?,
            );
        }
        self.flush().await?;
        report.pruned_locks =
            self.locks.prune() + self.storage.prune_locks() + self.cache.prune_locks();
        Ok(report)
    }

    pub async fn get_health_stats(&self) -> Result<HealthStats> {
        let tiers = self.storage.stats();
        Ok(HealthStats {
            documents: tiers.total(),
            tiers,
            partitions: self.partitions.health(),
            cache: self.cache.get_stats(),
            vector_entries: self.vectors.count().await?,
            key_fingerprint: self.vault.key_fingerprint(),
        })
    }

    pub fn get_profiler_stats(&self) -> ProfilerStats {
        self.profiler.snapshot()
    }
}

/// Purges run under the engine key lock, so a member is either purged with
/// its chunks and cache entry or, when re-added meanwhile, left alone.
#[async_trait]
impl MemberPurge for MemoryEngine {
    async fn purge_member(
        &self,
        partition: &Partition,
        key: &str,
        actor: &str,
    ) -> Result<Option<StoredEntry>> {
        let _guard = self.locks.lock(key).await;
        let Some(entry) = self
            .storage
            .entry(key)
            .filter(|entry| still_member(partition, entry))
        else {
            return Ok(None);
        };
        self.delete_chunks(key, entry.chunk_count).await?;
        self.cache.invalidate(key).await;
        self.storage
            .remove_if(key, actor, |current| still_member(partition, current))
            .await
    }
}
