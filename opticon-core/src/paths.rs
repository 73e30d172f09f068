//! On-disk layout under `<home>/.opticon/`.
//!
//! ```text
//! ~/.opticon/
//!   settings.yaml
//!   settings.local.yaml     (optional overrides, deep-merged)
//!   catalog/<env>.yaml      (one catalog partition per environment)
//!   journal/<env>.json      (pending catalog mutation, if any)
//!   run/<env>.lock          (held while an environment reconciles)
//!   staging/<env>/          (retrieved content, discarded after replay)
//!   trees/<env>/            (default working tree location)
//! ```

use std::path::{Path, PathBuf};

use crate::types::EnvironmentName;

pub const SETTINGS_FILE: &str = "settings.yaml";
pub const LOCAL_SETTINGS_FILE: &str = "settings.local.yaml";

pub fn opticon_root(home: &Path) -> PathBuf {
    home.join(".opticon")
}

pub fn settings_path(home: &Path) -> PathBuf {
    opticon_root(home).join(SETTINGS_FILE)
}

pub fn local_settings_path(home: &Path) -> PathBuf {
    opticon_root(home).join(LOCAL_SETTINGS_FILE)
}

pub fn catalog_path(home: &Path, env: &EnvironmentName) -> PathBuf {
    opticon_root(home)
        .join("catalog")
        .join(format!("{}.yaml", env.0))
}

pub fn journal_path(home: &Path, env: &EnvironmentName) -> PathBuf {
    opticon_root(home)
        .join("journal")
        .join(format!("{}.json", env.0))
}

pub fn lock_path(home: &Path, env: &EnvironmentName) -> PathBuf {
    opticon_root(home).join("run").join(format!("{}.lock", env.0))
}

pub fn staging_dir(home: &Path, env: &EnvironmentName) -> PathBuf {
    opticon_root(home).join("staging").join(&env.0)
}

pub fn default_trees_root(home: &Path) -> PathBuf {
    opticon_root(home).join("trees")
}
