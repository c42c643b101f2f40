//! Two-pass PII scan over a sealed corpus.
//!
//! Pass 1 looks only at metadata and ingest-time flags, so documents outside
//! the filter are never decrypted. Pass 2 decrypts the survivors one at a time
//! and runs detection on the plaintext.

use std::collections::BTreeSet;

use {
    async_trait::async_trait,
    mnemo_common::{ItemFailure, Metadata, Result},
    mnemo_config::PiiScanConfig,
    serde::Serialize,
    serde_json::json,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Vault,
    audit::AuditAction,
    pii::{PiiKind, find_pii},
};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Metadata pre-filter. Empty lists match every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PiiScanFilter {
    pub types: Vec<String>,
    pub domains: Vec<String>,
    /// Only documents modified at or after this instant (ms since epoch).
    pub modified_after_ms: Option<u64>,
    /// Report ingest-flagged documents without decrypting them.
    pub trust_ingest_flags: bool,
}

impl PiiScanFilter {
    pub fn from_config(config: &PiiScanConfig, now_ms: u64) -> Self {
        Self {
            types: config.types.clone(),
            domains: config.domains.clone(),
            modified_after_ms: config
                .modified_within_days
                .map(|days| now_ms.saturating_sub(days * DAY_MS)),
            trust_ingest_flags: config.trust_ingest_flags,
        }
    }

    pub fn matches(&self, candidate: &ScanCandidate) -> bool {
        if let Some(after) = self.modified_after_ms
            && candidate.modified_ms < after
        {
            return false;
        }
        field_matches(&candidate.metadata, "type", &self.types)
            && field_matches(&candidate.metadata, "domain", &self.domains)
    }
}

fn field_matches(metadata: &Metadata, field: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    metadata
        .get(field)
        .and_then(|v| v.as_str())
        .is_some_and(|v| allowed.iter().any(|a| a == v))
}

/// Metadata view of one document; building it must not require decryption.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub key: String,
    pub metadata: Metadata,
    pub modified_ms: u64,
    pub pii_flagged: bool,
}

/// Document payload as persisted.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub bytes: Vec<u8>,
    pub encrypted: bool,
}

/// A corpus the vault can scan without knowing how it is stored.
#[async_trait]
pub trait PiiCorpus: Send + Sync {
    async fn scan_candidates(&self) -> Result<Vec<ScanCandidate>>;

    async fn load_payload(&self, key: &str) -> Result<SealedPayload>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PiiScanReport {
    pub flagged: BTreeSet<String>,
    pub total: usize,
    pub filtered_out: usize,
    pub trusted_flags: usize,
    pub decrypted: usize,
    pub failures: Vec<ItemFailure>,
    pub cancelled: bool,
}

impl PiiScanReport {
    /// Surface per-document failures as `PartialFailure`.
    pub fn into_result(self) -> Result<BTreeSet<String>> {
        mnemo_common::Error::from_failures(self.total, self.failures)?;
        Ok(self.flagged)
    }
}

impl Vault {
    /// Scan `corpus` for PII. Cancellation is checked before each document;
    /// a cancelled scan returns what it found so far with `cancelled` set.
    pub async fn scan_for_pii(
        &self,
        corpus: &dyn PiiCorpus,
        filter: &PiiScanFilter,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<PiiScanReport> {
        let candidates = corpus.scan_candidates().await?;
        let mut report = PiiScanReport {
            total: candidates.len(),
            ..PiiScanReport::default()
        };

        let mut to_decrypt = Vec::new();
        for candidate in candidates {
            if !filter.matches(&candidate) {
                report.filtered_out += 1;
            } else if filter.trust_ingest_flags && candidate.pii_flagged {
                report.trusted_flags += 1;
                report.flagged.insert(candidate.key);
            } else {
                to_decrypt.push(candidate.key);
            }
        }
        debug!(
            total = report.total,
            filtered_out = report.filtered_out,
            trusted = report.trusted_flags,
            to_decrypt = to_decrypt.len(),
            "pii scan pre-filter complete"
        );

        for key in to_decrypt {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.scan_one(corpus, &key).await {
                Ok(kinds) => {
                    report.decrypted += 1;
                    if !kinds.is_empty() {
                        report.flagged.insert(key);
                    }
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "pii scan failed for document");
                    if e.is_integrity() {
                        self.record_best_effort(
                            AuditAction::IntegrityFailure,
                            actor,
                            &key,
                            json!({ "during": "pii_scan", "error": e.to_string() }),
                        )
                        .await;
                    }
                    report.failures.push(ItemFailure::new(key, e));
                },
            }
        }

        self.record_best_effort(
            AuditAction::PiiScan,
            actor,
            "corpus",
            json!({
                "total": report.total,
                "flagged": report.flagged.len(),
                "decrypted": report.decrypted,
                "failures": report.failures.len(),
                "cancelled": report.cancelled,
            }),
        )
        .await;
        info!(
            flagged = report.flagged.len(),
            decrypted = report.decrypted,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "pii scan complete"
        );
        Ok(report)
    }

    async fn scan_one(&self, corpus: &dyn PiiCorpus, key: &str) -> Result<Vec<PiiKind>> {
        let payload = corpus.load_payload(key).await?;
        let plaintext = if payload.encrypted {
            self.decrypt(&payload.bytes, key)?
        } else {
            payload.bytes
        };
        Ok(find_pii(&String::from_utf8_lossy(&plaintext)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::test_support::vault_in,
        mnemo_common::Error,
        std::collections::HashMap,
        std::sync::atomic::{AtomicUsize, Ordering},
        tempfile::TempDir,
    };

    struct FakeCorpus {
        candidates: Vec<ScanCandidate>,
        payloads: HashMap<String, SealedPayload>,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl PiiCorpus for FakeCorpus {
        async fn scan_candidates(&self) -> Result<Vec<ScanCandidate>> {
            Ok(self.candidates.clone())
        }

        async fn load_payload(&self, key: &str) -> Result<SealedPayload> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.payloads
                .get(key)
                .cloned()
                .ok_or_else(|| Error::not_found(key))
        }
    }

    fn candidate(key: &str, doc_type: &str, modified_ms: u64, flagged: bool) -> ScanCandidate {
        let mut metadata = Metadata::new();
        metadata.insert("type".into(), json!(doc_type));
        ScanCandidate {
            key: key.into(),
            metadata,
            modified_ms,
            pii_flagged: flagged,
        }
    }

    async fn corpus(vault: &Vault) -> FakeCorpus {
        let mut payloads = HashMap::new();
        for (key, text) in [
            ("email", "contact ops@example.com"),
            ("clean", "nothing to see"),
            ("flagged", "also clean but flagged at ingest"),
            ("old", "old@example.com"),
        ] {
            payloads.insert(key.to_string(), SealedPayload {
                bytes: vault.encrypt(text.as_bytes(), key).unwrap(),
                encrypted: true,
            });
        }
        payloads.insert("corrupt".into(), SealedPayload {
            bytes: vec![0u8; 64],
            encrypted: true,
        });
        FakeCorpus {
            candidates: vec![
                candidate("email", "note", 1_000, false),
                candidate("clean", "note", 1_000, false),
                candidate("flagged", "note", 1_000, true),
                candidate("old", "note", 10, false),
                candidate("corrupt", "note", 1_000, false),
                candidate("other-type", "ticket", 1_000, false),
            ],
            payloads,
            loads: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn prefilter_limits_decryption() {
        let tmp = TempDir::new().unwrap();
        let vault = vault_in(tmp.path()).await;
        let corpus = corpus(&vault).await;
        let filter = PiiScanFilter {
            types: vec!["note".into()],
            modified_after_ms: Some(500),
            trust_ingest_flags: true,
            ..PiiScanFilter::default()
        };

        let report = vault
            .scan_for_pii(&corpus, &filter, "auditor", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.flagged.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["email", "flagged"]
        );
        assert_eq!(report.filtered_out, 2);
        assert_eq!(report.trusted_flags, 1);
        // email, clean and corrupt were loaded; flagged/old/other-type never were.
        assert_eq!(corpus.loads.load(Ordering::SeqCst), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "corrupt");

        let audit = vault.audit_log().read_all().await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::IntegrityFailure && e.subject == "corrupt"));
        assert!(audit.iter().any(|e| e.action == AuditAction::PiiScan));
    }

    #[tokio::test]
    async fn partial_failure_surfaces_through_into_result() {
        let tmp = TempDir::new().unwrap();
        let vault = vault_in(tmp.path()).await;
        let corpus = corpus(&vault).await;
        let report = vault
            .scan_for_pii(&corpus, &PiiScanFilter::default(), "auditor", &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.flagged.contains("old"));
        assert!(matches!(
            report.into_result(),
            Err(Error::PartialFailure { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_scan_stops_before_decrypting() {
        let tmp = TempDir::new().unwrap();
        let vault = vault_in(tmp.path()).await;
        let corpus = corpus(&vault).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let filter = PiiScanFilter {
            trust_ingest_flags: true,
            ..PiiScanFilter::default()
        };
        let report = vault
            .scan_for_pii(&corpus, &filter, "auditor", &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(corpus.loads.load(Ordering::SeqCst), 0);
        assert!(report.flagged.contains("flagged"));
    }

    #[test]
    fn filter_from_config_converts_days() {
        let config = PiiScanConfig {
            modified_within_days: Some(2),
            ..PiiScanConfig::default()
        };
        let filter = PiiScanFilter::from_config(&config, 10 * DAY_MS);
        assert_eq!(filter.modified_after_ms, Some(8 * DAY_MS));
        assert!(filter.trust_ingest_flags);
    }
}
