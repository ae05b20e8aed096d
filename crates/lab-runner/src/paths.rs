use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const LAB_HOME_ENV: &str = "LAB_HOME";
pub const CONFIG_FILE: &str = "config.json";
pub const INDEX_FILE: &str = "repo.json";
pub const INFO_FILE: &str = "info.json";
pub const EXCEPTION_FILE: &str = "exception.log";
pub const REPO_LAB_DIR: &str = ".lab";

/// Machine-global lab directory holding the user config and the global
/// side-index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabHome {
    root: PathBuf,
}

impl LabHome {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$LAB_HOME` when set, otherwise `~/.lab`.
    pub fn discover() -> Result<Self> {
        if let Some(root) = std::env::var_os(LAB_HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::at(root));
        }
        dirs::home_dir()
            .map(|home| Self::at(home.join(".lab")))
            .ok_or(Error::NoHome)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn default_experiments_root(&self) -> PathBuf {
        self.root.join("experiments")
    }
}

pub fn repo_lab_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(REPO_LAB_DIR)
}

pub fn repo_config_path(repo_root: &Path) -> PathBuf {
    repo_lab_dir(repo_root).join(CONFIG_FILE)
}

pub fn repo_index_path(repo_root: &Path) -> PathBuf {
    repo_lab_dir(repo_root).join(INDEX_FILE)
}
