//! Process configuration, passed explicitly into the differ and replayer.
//!
//! Loaded from `<home>/.opticon/settings.yaml`; an optional
//! `settings.local.yaml` beside it is deep-merged on top.
//!
//! Like the rest of this crate, every loader has a `_at(home)` form used by
//! tests and a no-arg wrapper that resolves `dirs::home_dir()`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::SettingsError;
use crate::paths;
use crate::types::EnvironmentName;

/// One managed environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    pub name: EnvironmentName,
    #[serde(default)]
    pub production: bool,
    /// Root of a directory-backed metadata mirror, if this environment uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    /// Push commits upstream after replay.
    #[serde(default = "default_true")]
    pub push: bool,
}

impl EnvironmentSettings {
    pub fn new(name: impl Into<EnvironmentName>) -> Self {
        Self {
            name: name.into(),
            production: false,
            source_path: None,
            push: true,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Metadata types listed when building a snapshot.
    pub metadata_types: Vec<String>,
    /// Types whose modification timestamps are unreliable.
    pub force_change: Vec<String>,
    /// Parent of every working tree; defaults to `<home>/.opticon/trees`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub api_version: String,
    pub retrieve_timeout_secs: u64,
    pub retrieve_attempts: u32,
    pub author_email_domain: String,
    pub remote: String,
    pub environments: Vec<EnvironmentSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metadata_types: [
                "ApexClass",
                "ApexComponent",
                "ApexPage",
                "ApexTrigger",
                "CustomObject",
                "Layout",
                "StaticResource",
                "Workflow",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            force_change: Vec::new(),
            local_path: None,
            api_version: "29.0".to_string(),
            retrieve_timeout_secs: 300,
            retrieve_attempts: 3,
            author_email_domain: "opticon.local".to_string(),
            remote: "origin".to_string(),
            environments: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings rooted at `home`. Missing files yield defaults.
    pub fn load_at(home: &Path) -> Result<Self, SettingsError> {
        let base = read_yaml_value(&paths::settings_path(home))?;
        let local = read_yaml_value(&paths::local_settings_path(home))?;

        let merged = match (base, local) {
            (None, None) => return Ok(Self::default()),
            (Some(v), None) | (None, Some(v)) => v,
            (Some(mut base), Some(local)) => {
                deep_merge(&mut base, local);
                base
            }
        };

        serde_yaml::from_value(merged).map_err(|source| SettingsError::Parse {
            path: paths::settings_path(home),
            source,
        })
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, SettingsError> {
        let home = dirs::home_dir().ok_or(SettingsError::HomeNotFound)?;
        Self::load_at(&home)
    }

    pub fn environment(&self, name: &EnvironmentName) -> Result<&EnvironmentSettings, SettingsError> {
        self.environments
            .iter()
            .find(|e| &e.name == name)
            .ok_or_else(|| SettingsError::UnknownEnvironment(name.clone()))
    }

    pub fn force_modify_types(&self) -> BTreeSet<String> {
        self.force_change.iter().cloned().collect()
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieve_timeout_secs)
    }

    /// `<local_path>/<env>`, or `<home>/.opticon/trees/<env>` when unset.
    pub fn working_tree_path(&self, home: &Path, env: &EnvironmentName) -> PathBuf {
        self.local_path
            .clone()
            .unwrap_or_else(|| paths::default_trees_root(home))
            .join(&env.0)
    }
}

fn default_true() -> bool {
    true
}

fn read_yaml_value(path: &Path) -> Result<Option<Value>, SettingsError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_yaml::from_str::<Value>(&contents).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    // An empty file parses as null; treat it like a missing one.
    Ok(match value {
        Value::Null => None,
        other => Some(other),
    })
}

/// Recursively overlay `overlay` onto `base`. Mappings merge key by key;
/// any other value in `overlay` replaces the one in `base`.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => merge_mappings(base_map, overlay_map),
        (base, overlay) => *base = overlay,
    }
}

fn merge_mappings(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                base.insert(key, value);
            }
        }
    }
}
