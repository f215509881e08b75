use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::NodeConfig;
use crate::errors::MultiplexResult;
use crate::scope::ScopeId;

pub const DEFAULT_CONFIG_DIR: &str = "config";
pub const DEFAULT_DATA_DIR: &str = "data";

/// Per-scope filesystem layout under the node root.
///
/// Every `(user address, scope)` pair owns one config and one data
/// subdirectory, keyed here by scope hash:
///
/// ```text
/// <root>/config/<address>/<fingerprint>/
/// <root>/data/<address>/<fingerprint>/
/// ```
#[derive(Clone, Debug, Default)]
pub struct MultiplexFs {
    config_dirs: BTreeMap<String, PathBuf>,
    data_dirs: BTreeMap<String, PathBuf>,
}

impl MultiplexFs {
    /// Creates the full per-scope directory tree. Safe to call repeatedly;
    /// existing directories are left as they are.
    pub fn ensure_root(
        root_dir: &Path,
        user_scopes: &BTreeMap<String, Vec<String>>,
    ) -> MultiplexResult<Self> {
        let mut layout = Self::default();
        for (address, scopes) in user_scopes {
            for scope in scopes {
                let scope_id = ScopeId::new(address.clone(), scope.clone())?;
                let config_dir = scoped_config_dir(root_dir, address, &scope_id.fingerprint());
                let data_dir = scoped_data_dir(root_dir, address, &scope_id.fingerprint());
                fs::create_dir_all(&config_dir)?;
                fs::create_dir_all(&data_dir)?;
                layout.config_dirs.insert(scope_id.hash(), config_dir);
                layout.data_dirs.insert(scope_id.hash(), data_dir);
            }
        }
        Ok(layout)
    }

    pub fn from_config(config: &NodeConfig) -> MultiplexResult<Self> {
        Self::ensure_root(&config.root_dir, &config.user.user_scopes)
    }

    pub fn config_dir(&self, scope_hash: &str) -> Option<&Path> {
        self.config_dirs.get(scope_hash).map(PathBuf::as_path)
    }

    pub fn data_dir(&self, scope_hash: &str) -> Option<&Path> {
        self.data_dirs.get(scope_hash).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.data_dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_dirs.is_empty()
    }
}

pub fn scoped_config_dir(root_dir: &Path, address: &str, fingerprint: &str) -> PathBuf {
    root_dir.join(DEFAULT_CONFIG_DIR).join(address).join(fingerprint)
}

pub fn scoped_data_dir(root_dir: &Path, address: &str, fingerprint: &str) -> PathBuf {
    root_dir.join(DEFAULT_DATA_DIR).join(address).join(fingerprint)
}
