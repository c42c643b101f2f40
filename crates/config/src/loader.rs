use std::path::{Path, PathBuf};

use {
    mnemo_common::{Error, Result},
    tracing::{debug, info, warn},
};

use crate::{
    schema::{MemoryEngineConfig, PiiPolicy},
    validate::validate,
};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MNEMO_CONFIG";

const CONFIG_FILE_NAME: &str = "mnemo.toml";

/// Load and validate a TOML config file.
pub fn load_from_path(path: &Path) -> Result<MemoryEngineConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: MemoryEngineConfig = toml::from_str(&content).map_err(|e| {
        Error::InvalidConfiguration(format!("{}: {e}", path.display()))
    })?;
    validate(&config)?;
    info!(path = %path.display(), "loaded memory engine config");
    Ok(config)
}

/// Resolve the config file (`$MNEMO_CONFIG`, then the platform config dir),
/// apply environment overrides and validate.
///
/// A missing file yields defaults. An unreadable or invalid file is an error:
/// silently running with defaults would point the engine at the wrong data.
pub fn discover_and_load() -> Result<MemoryEngineConfig> {
    let mut config = match discover_path() {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content).map_err(|e| {
                Error::InvalidConfiguration(format!("{}: {e}", path.display()))
            })?
        },
        None => {
            info!("no memory engine config file found, using defaults");
            MemoryEngineConfig::default()
        },
    };
    apply_env_overrides(&mut config, std::env::vars());
    validate(&config)?;
    Ok(config)
}

fn discover_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        debug!(path = %explicit, "using config from {CONFIG_ENV_VAR}");
        return Some(PathBuf::from(explicit));
    }
    let candidate = crate::default_config_dir()?.join(CONFIG_FILE_NAME);
    if candidate.is_file() {
        Some(candidate)
    } else {
        debug!(path = %candidate.display(), "config file not found");
        None
    }
}

/// Apply `MNEMO_*` overrides from `vars`. Unparseable values are logged and
/// ignored.
pub fn apply_env_overrides<I>(config: &mut MemoryEngineConfig, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in vars {
        let Some(suffix) = name.strip_prefix("MNEMO_") else {
            continue;
        };
        let applied = match suffix {
            "DATA_DIR" => {
                config.storage.data_dir = PathBuf::from(&value);
                true
            },
            "L1_CAPACITY" => set_parsed(&mut config.cache.l1_capacity, &value),
            "L2_CAPACITY" => set_parsed(&mut config.cache.l2_capacity, &value),
            "CACHE_TTL_SECS" => set_parsed(&mut config.cache.default_ttl_secs, &value),
            "HOT_CAPACITY" => set_parsed(&mut config.tiers.hot_capacity, &value),
            "WARM_CAPACITY" => set_parsed(&mut config.tiers.warm_capacity, &value),
            "HOT_IDLE_SECS" => set_parsed(&mut config.tiers.hot_idle_secs, &value),
            "WARM_IDLE_SECS" => set_parsed(&mut config.tiers.warm_idle_secs, &value),
            "CHUNK_WINDOW" => set_parsed(&mut config.chunking.window_size_words, &value),
            "CHUNK_OVERLAP" => set_parsed(&mut config.chunking.overlap_words, &value),
            "PII_POLICY" => match value.to_ascii_lowercase().as_str() {
                "flag" => {
                    config.security.pii_policy = PiiPolicy::Flag;
                    true
                },
                "reject" => {
                    config.security.pii_policy = PiiPolicy::Reject;
                    true
                },
                _ => false,
            },
            _ => continue,
        };
        if applied {
            debug!(var = %name, "applied environment override");
        } else {
            warn!(var = %name, value = %value, "ignoring unparseable environment override");
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        },
        Err(_) => false,
    }
}
