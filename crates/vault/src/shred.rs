use std::path::Path;

use {
    mnemo_common::Result,
    sha2::{Digest, Sha256},
    tokio::io::{AsyncSeekExt, AsyncWriteExt},
};

const SHRED_BLOCK: usize = 64 * 1024;

/// Map a caller-chosen key to a filesystem-safe, collision-resistant name
/// (SHA-256 hex). Deterministic across processes.
pub fn safe_filename(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Overwrite a file with zeros, flush it to disk, then unlink it.
///
/// Returns `false` when the file did not exist; a missing file is not an
/// error so deletes stay idempotent.
pub async fn shred_file(path: &Path) -> Result<bool> {
    let mut file = match tokio::fs::OpenOptions::new().write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata().await?.len() as usize;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    let zeros = vec![0u8; SHRED_BLOCK.min(len.max(1))];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(zeros.len());
        file.write_all(&zeros[..n]).await?;
        remaining -= n;
    }
    file.sync_all().await?;
    drop(file);

    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}
