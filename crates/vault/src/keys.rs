//! Master key resolution.
//!
//! Priority: external [`SecretsProvider`] → environment variable → local key
//! file (generated on first use).
//!
//! **Key loss is unrecoverable.** Every sealed document, L2 cache entry and
//! tier record is encrypted under this key; without it the data cannot be
//! read back by anyone. The local key file must be backed up alongside (but
//! stored separately from) the data directory. A fingerprint of the key is
//! written next to the data so that opening it with a different key fails
//! immediately instead of surfacing as per-document integrity errors.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    base64::{Engine as _, engine::general_purpose::STANDARD},
    mnemo_common::{Error, Result},
    mnemo_config::SecurityConfig,
    secrecy::{ExposeSecret, Secret},
    sha2::{Digest, Sha256},
    tokio::io::AsyncWriteExt,
    tracing::{error, info, warn},
};

use crate::cipher::{KEY_LEN, generate_key};

/// External secret store (cloud KMS, Vault, keychain, ...).
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    async fn get_secret(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// In-process provider backed by a map.
#[derive(Default)]
pub struct MapSecretsProvider {
    secrets: HashMap<String, Vec<u8>>,
}

impl MapSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretsProvider for MapSecretsProvider {
    async fn get_secret(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// Where the active master key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    SecretsProvider(String),
    Environment(String),
    KeyFile(PathBuf),
    /// Freshly generated and persisted to the given file.
    Generated(PathBuf),
    Explicit,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecretsProvider(name) => write!(f, "secrets provider ({name})"),
            Self::Environment(var) => write!(f, "environment ({var})"),
            Self::KeyFile(path) => write!(f, "key file ({})", path.display()),
            Self::Generated(path) => write!(f, "generated ({})", path.display()),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

pub struct MasterKey {
    bytes: Secret<[u8; KEY_LEN]>,
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Secret::new(bytes),
        }
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.bytes.expose_secret()
    }

    /// Short, non-reversible identifier of the key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"mnemo-key-fingerprint:");
        hasher.update(self.expose());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Accept either 32 raw bytes or base64 text encoding 32 bytes.
pub fn decode_key_material(material: &[u8]) -> Result<[u8; KEY_LEN]> {
    if material.len() == KEY_LEN {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(material);
        return Ok(key);
    }
    let text = std::str::from_utf8(material)
        .map_err(|_| Error::InvalidConfiguration("key material is neither raw nor base64".into()))?;
    let decoded = STANDARD
        .decode(text.trim())
        .map_err(|e| Error::InvalidConfiguration(format!("key material is not valid base64: {e}")))?;
    if decoded.len() != KEY_LEN {
        return Err(Error::InvalidConfiguration(format!(
            "key must be {KEY_LEN} bytes, got {}",
            decoded.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&decoded);
    Ok(key)
}

pub fn default_key_file(data_dir: &Path) -> PathBuf {
    data_dir.join("keys").join("master.key")
}

/// Resolve the master key following the documented priority order.
///
/// A source that is present but malformed is an error rather than a reason
/// to fall through: falling through would silently generate a fresh key and
/// strand everything sealed under the intended one.
pub async fn resolve_master_key(
    config: &SecurityConfig,
    data_dir: &Path,
    provider: Option<&dyn SecretsProvider>,
) -> Result<(MasterKey, KeySource)> {
    if let Some(provider) = provider
        && let Some(material) = provider.get_secret(&config.secret_name).await?
    {
        let key = decode_key_material(&material)?;
        return Ok((
            MasterKey::from_bytes(key),
            KeySource::SecretsProvider(config.secret_name.clone()),
        ));
    }

    if let Ok(value) = std::env::var(&config.key_env_var) {
        let key = decode_key_material(value.as_bytes())?;
        return Ok((
            MasterKey::from_bytes(key),
            KeySource::Environment(config.key_env_var.clone()),
        ));
    }

    let path = config
        .key_file
        .clone()
        .unwrap_or_else(|| default_key_file(data_dir));
    load_or_generate_key_file(&path).await
}

async fn load_or_generate_key_file(path: &Path) -> Result<(MasterKey, KeySource)> {
    match tokio::fs::read(path).await {
        Ok(material) => {
            let key = decode_key_material(&material)?;
            return Ok((MasterKey::from_bytes(key), KeySource::KeyFile(path.to_path_buf())));
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let key = generate_key();
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(STANDARD.encode(key).as_bytes()).await?;
    file.sync_all().await?;
    restrict_permissions(path).await?;

    warn!(
        path = %path.display(),
        "generated a new master key; back this file up, losing it makes all encrypted data unrecoverable"
    );
    Ok((MasterKey::from_bytes(key), KeySource::Generated(path.to_path_buf())))
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Compare the key against the fingerprint stored in `data_dir`, writing it on
/// first use.
pub async fn verify_fingerprint(key: &MasterKey, data_dir: &Path) -> Result<()> {
    let path = data_dir.join("keys").join("fingerprint");
    let actual = key.fingerprint();
    match tokio::fs::read_to_string(&path).await {
        Ok(stored) => {
            let expected = stored.trim().to_string();
            if expected != actual {
                error!(
                    expected = %expected,
                    actual = %actual,
                    "master key does not match the data directory; refusing to open"
                );
                return Err(Error::KeyMismatch { expected, actual });
            }
            Ok(())
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &actual).await?;
            info!(fingerprint = %actual, "recorded master key fingerprint");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, tempfile::TempDir};

    fn config_with_env(var: &str) -> SecurityConfig {
        SecurityConfig {
            key_env_var: var.into(),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn decodes_raw_and_base64() {
        let raw = [7u8; KEY_LEN];
        assert_eq!(decode_key_material(&raw).unwrap(), raw);
        let encoded = STANDARD.encode(raw);
        assert_eq!(decode_key_material(encoded.as_bytes()).unwrap(), raw);
        assert_eq!(
            decode_key_material(format!("{encoded}\n").as_bytes()).unwrap(),
            raw
        );
    }

    #[test]
    fn rejects_short_keys() {
        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            decode_key_material(short.as_bytes()),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn provider_takes_priority() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_env("MNEMO_TEST_KEY_UNSET_PROVIDER");
        let provider = MapSecretsProvider::new().with_secret(config.secret_name.clone(), [3u8; 32]);
        let (key, source) = resolve_master_key(&config, tmp.path(), Some(&provider))
            .await
            .unwrap();
        assert_eq!(key.expose(), &[3u8; 32]);
        assert_eq!(source, KeySource::SecretsProvider(config.secret_name));
        assert!(!default_key_file(tmp.path()).exists());
    }

    #[tokio::test]
    async fn generates_then_reuses_key_file() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_env("MNEMO_TEST_KEY_UNSET_FILE");
        let (first, source) = resolve_master_key(&config, tmp.path(), None).await.unwrap();
        assert!(matches!(source, KeySource::Generated(_)));

        let (second, source) = resolve_master_key(&config, tmp.path(), None).await.unwrap();
        assert!(matches!(source, KeySource::KeyFile(_)));
        assert_eq!(first.fingerprint(), second.fingerprint());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(default_key_file(tmp.path()))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let a = MasterKey::from_bytes([1u8; KEY_LEN]);
        let b = MasterKey::from_bytes([2u8; KEY_LEN]);
        verify_fingerprint(&a, tmp.path()).await.unwrap();
        verify_fingerprint(&a, tmp.path()).await.unwrap();
        assert!(matches!(
            verify_fingerprint(&b, tmp.path()).await,
            Err(Error::KeyMismatch { .. })
        ));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = MasterKey::from_bytes([9u8; KEY_LEN]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("fingerprint"));
        assert!(!rendered.contains("9, 9"));
    }
}
