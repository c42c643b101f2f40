//! Append-only audit trail, one JSON object per line.

use std::path::{Path, PathBuf};

use {
    chrono::{DateTime, Utc},
    mnemo_common::Result,
    serde::{Deserialize, Serialize},
    tokio::{fs::File, io::AsyncWriteExt, sync::Mutex},
    tracing::warn,
};

/// Security-relevant action being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    KeyGenerated,
    Encrypt,
    SecureDelete,
    PiiFlagged,
    PiiRejected,
    PiiScan,
    IntegrityFailure,
    MigrationFailure,
    PartitionCleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// Writes are serialized through a mutex and flushed before returning.
/// Entries are never rewritten or removed by the engine.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read back every entry. Malformed lines (e.g. a torn final write) are
    /// skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %self.path.display(), line = lineno + 1, error = %e, "skipping malformed audit line");
                },
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, serde_json::json, std::sync::Arc, tempfile::TempDir};

    fn entry(action: AuditAction, subject: &str) -> AuditEntry {
        AuditEntry {
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            action,
            actor: "tester".into(),
            subject: subject.into(),
            details: json!({ "n": 1 }),
        }
    }

    #[tokio::test]
    async fn appends_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::open(tmp.path().join("audit.log")).await.unwrap();
        log.append(&entry(AuditAction::Encrypt, "a")).await.unwrap();
        log.append(&entry(AuditAction::SecureDelete, "a")).await.unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, AuditAction::SecureDelete);
        assert_eq!(entries[0].details["n"], 1);
    }

    #[tokio::test]
    async fn reopening_appends_instead_of_truncating() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.log");
        AuditLog::open(&path)
            .await
            .unwrap()
            .append(&entry(AuditAction::PiiFlagged, "x"))
            .await
            .unwrap();
        let log = AuditLog::open(&path).await.unwrap();
        log.append(&entry(AuditAction::PiiScan, "all")).await.unwrap();
        assert_eq!(log.read_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(AuditLog::open(tmp.path().join("audit.log")).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..32 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.append(&entry(AuditAction::Encrypt, &format!("doc-{i}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(log.read_all().await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.log");
        let log = AuditLog::open(&path).await.unwrap();
        log.append(&entry(AuditAction::Encrypt, "a")).await.unwrap();
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"timestamp\":\n");
        std::fs::write(&path, raw).unwrap();
        assert_eq!(log.read_all().await.unwrap().len(), 1);
    }
}
