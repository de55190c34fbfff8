//! Settings file support.
//!
//! Flags win over environment (`KUBENEST_*`, bound by the CLI layer) which
//! wins over the optional TOML file; this module only handles the file part
//! and the merge helper the CLI uses.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{KubenestError, KubenestResult};

/// Values settable from `~/.config/kubenest/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub name: Option<String>,
    pub verbosity: Option<String>,
    pub logfile: Option<PathBuf>,
    pub json: Option<bool>,
    pub root: Option<PathBuf>,
    pub timeout: Option<u64>,
    pub ip_address: Option<String>,
    pub domain_name: Vec<String>,
    pub kustomize_url: Option<String>,
    pub age_key_file: Option<PathBuf>,
    pub ssh_key_file: Option<PathBuf>,
    pub ssh_hosts: Vec<String>,
}

/// Default settings file location.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kubenest").join("config.toml"))
}

/// Load settings. An explicitly given file must exist and parse; the
/// default location is optional.
pub fn load(explicit: Option<&Path>) -> KubenestResult<Settings> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match default_path() {
            Some(path) => (path, false),
            None => return Ok(Settings::default()),
        },
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(KubenestError::Settings(format!(
                "reading {}: {e}",
                path.display()
            )));
        }
    };
    toml::from_str(&content)
        .map_err(|e| KubenestError::Settings(format!("parsing {}: {e}", path.display())))
}

impl Settings {
    /// Effective-settings dump for `configure print`.
    pub fn to_toml(&self) -> KubenestResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| KubenestError::Settings(format!("serializing settings: {e}")))
    }
}
