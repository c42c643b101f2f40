//! Configuration for the mnemo memory engine: TOML file → defaults →
//! `MNEMO_*` environment overrides → validation.

pub mod loader;
pub mod schema;
pub mod validate;

use std::path::PathBuf;

pub use {
    loader::{CONFIG_ENV_VAR, apply_env_overrides, discover_and_load, load_from_path},
    schema::*,
    validate::validate,
};

/// Platform data directory, falling back to `./mnemo-data`.
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "mnemo", "mnemo")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("mnemo-data"))
}

/// Platform config directory, if the platform has one.
pub fn default_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "mnemo", "mnemo")
        .map(|dirs| dirs.config_dir().to_path_buf())
}
