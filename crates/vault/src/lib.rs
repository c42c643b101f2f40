//! Security services for the memory engine: authenticated encryption under a
//! managed master key, PII detection and scanning, input sanitization,
//! collision-resistant on-disk naming, secure deletion and the audit trail.

pub mod audit;
pub mod cipher;
pub mod keys;
pub mod pii;
pub mod sanitize;
pub mod scan;
pub mod shred;

use std::path::{Path, PathBuf};

use {
    mnemo_common::{Result, SharedClock},
    mnemo_config::SecurityConfig,
    serde_json::json,
    tracing::{error, info},
};

pub use {
    audit::{AuditAction, AuditEntry, AuditLog},
    keys::{KeySource, MapSecretsProvider, MasterKey, SecretsProvider},
    pii::{PiiKind, detect_pii, find_pii},
    sanitize::sanitize,
    scan::{PiiCorpus, PiiScanFilter, PiiScanReport, ScanCandidate, SealedPayload},
    shred::safe_filename,
};

/// Actor recorded for actions the engine takes on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

pub struct Vault {
    key: MasterKey,
    key_source: KeySource,
    audit: AuditLog,
    clock: SharedClock,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("key", &self.key)
            .field("key_source", &self.key_source)
            .field("audit", &self.audit.path())
            .finish()
    }
}

impl Vault {
    /// Resolve the master key, check it against the data directory's
    /// fingerprint and open the audit log at `<data_dir>/audit.log`.
    pub async fn open(
        data_dir: &Path,
        config: &SecurityConfig,
        secrets: Option<&dyn SecretsProvider>,
        clock: SharedClock,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let (key, key_source) = keys::resolve_master_key(config, data_dir, secrets).await?;
        keys::verify_fingerprint(&key, data_dir).await?;
        let vault = Self::with_key(key, key_source, data_dir.join("audit.log"), clock).await?;

        if let KeySource::Generated(path) = &vault.key_source {
            vault
                .record(
                    AuditAction::KeyGenerated,
                    SYSTEM_ACTOR,
                    &path.display().to_string(),
                    json!({ "fingerprint": vault.key.fingerprint() }),
                )
                .await?;
        }
        info!(source = %vault.key_source, fingerprint = %vault.key.fingerprint(), "vault opened");
        Ok(vault)
    }

    /// Build a vault around an already-resolved key.
    pub async fn with_key(
        key: MasterKey,
        key_source: KeySource,
        audit_path: impl Into<PathBuf>,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(Self {
            key,
            key_source,
            audit: AuditLog::open(audit_path).await?,
            clock,
        })
    }

    pub fn key_source(&self) -> &KeySource {
        &self.key_source
    }

    pub fn key_fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Seal `plaintext` under the master key, bound to `subject` (the
    /// document or cache key) as associated data.
    pub fn encrypt(&self, plaintext: &[u8], subject: &str) -> Result<Vec<u8>> {
        cipher::seal(self.key.expose(), plaintext, subject.as_bytes())
    }

    /// Fails with `Integrity` if the payload was tampered with, sealed under
    /// another key or sealed for another subject.
    pub fn decrypt(&self, sealed: &[u8], subject: &str) -> Result<Vec<u8>> {
        cipher::open(self.key.expose(), sealed, subject.as_bytes(), subject)
    }

    pub fn sanitize(&self, text: &str) -> String {
        sanitize(text)
    }

    pub fn safe_filename(&self, key: &str) -> String {
        safe_filename(key)
    }

    /// Shred every file in `paths` and record one audit entry for `subject`.
    /// Missing files are skipped, so repeating the call is a no-op success.
    /// Returns the number of files that were actually removed.
    pub async fn secure_delete(&self, subject: &str, actor: &str, paths: &[PathBuf]) -> Result<usize> {
        let mut removed = 0;
        for path in paths {
            match shred::shred_file(path).await {
                Ok(true) => removed += 1,
                Ok(false) => {},
                Err(e) => {
                    error!(subject, path = %path.display(), error = %e, "secure delete failed");
                    self.record_best_effort(
                        AuditAction::SecureDelete,
                        actor,
                        subject,
                        json!({ "status": "failed", "error": e.to_string() }),
                    )
                    .await;
                    return Err(e);
                },
            }
        }
        self.record(
            AuditAction::SecureDelete,
            actor,
            subject,
            json!({ "status": "ok", "files_removed": removed }),
        )
        .await?;
        Ok(removed)
    }

    /// Shred without an audit entry; for derived data such as cache files.
    pub async fn shred(&self, path: &Path) -> Result<bool> {
        shred::shred_file(path).await
    }

    pub async fn record(
        &self,
        action: AuditAction,
        actor: &str,
        subject: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        self.audit
            .append(&AuditEntry {
                timestamp: self.clock.now(),
                action,
                actor: actor.to_string(),
                subject: subject.to_string(),
                details,
            })
            .await
    }

    /// Like [`Vault::record`], but an audit write failure is only logged.
    /// Used on paths that are already reporting another error.
    pub async fn record_best_effort(
        &self,
        action: AuditAction,
        actor: &str,
        subject: &str,
        details: serde_json::Value,
    ) {
        if let Err(e) = self.record(action, actor, subject, details).await {
            error!(?action, subject, error = %e, "failed to write audit entry");
        }
    }
}
