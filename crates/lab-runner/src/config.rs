//! Three-scope configuration: user (machine-global), experiment (per project
//! directory) and repository (per version-controlled root).
//!
//! Reads resolve repository > experiment > user. Writes name their target
//! layer and touch only that layer's file. Each layer loads its JSON file on
//! first use; a malformed file never stops a run, the layer falls back to its
//! defaults and a [`ConfigDiagnostic`] is recorded.

use lab_core::{atomic_write_json_pretty, read_json_object, AttrNode, AttrValue};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::paths::{repo_config_path, LabHome};

pub const EXPERIMENTS_ROOT_KEY: &str = "experiments_root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigLevel {
    User,
    Experiment,
    Repository,
}

impl ConfigLevel {
    /// Most specific scope first.
    pub const PRECEDENCE: [ConfigLevel; 3] = [
        ConfigLevel::Repository,
        ConfigLevel::Experiment,
        ConfigLevel::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigLevel::User => "user",
            ConfigLevel::Experiment => "experiment",
            ConfigLevel::Repository => "repository",
        }
    }
}

impl fmt::Display for ConfigLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(ConfigLevel::User),
            "experiment" => Ok(ConfigLevel::Experiment),
            "repository" | "repo" => Ok(ConfigLevel::Repository),
            other => Err(Error::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDiagnostic {
    pub level: ConfigLevel,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for ConfigDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} config {}: {}",
            self.level,
            self.path.display(),
            self.message
        )
    }
}

#[derive(Debug)]
struct Layer {
    level: ConfigLevel,
    path: Option<PathBuf>,
    defaults: AttrNode,
    store: Option<AttrNode>,
}

impl Layer {
    fn new(level: ConfigLevel, path: Option<PathBuf>, defaults: AttrNode) -> Self {
        Self {
            level,
            path,
            defaults,
            store: None,
        }
    }

    fn diagnose(&self, path: &Path, message: String, out: &mut Vec<ConfigDiagnostic>) {
        warn!(level = %self.level, path = %path.display(), "{}; using defaults", message);
        out.push(ConfigDiagnostic {
            level: self.level,
            path: path.to_path_buf(),
            message,
        });
    }

    /// Loads the backing file on first use. `None` when the layer has no file.
    fn load(&mut self, diagnostics: &mut Vec<ConfigDiagnostic>) -> Option<&mut AttrNode> {
        let path = self.path.clone()?;
        if self.store.is_none() {
            let store = match read_json_object(&path) {
                Ok(Some(map)) => AttrNode::from(map),
                Ok(None) => {
                    let defaults = self.defaults.clone();
                    if !defaults.is_empty() {
                        if let Err(e) = atomic_write_json_pretty(&path, &defaults.to_json_value()) {
                            self.diagnose(&path, format!("bootstrap failed: {}", e), diagnostics);
                        } else {
                            debug!(level = %self.level, path = %path.display(), "bootstrapped config");
                        }
                    }
                    defaults
                }
                Err(e) => {
                    self.diagnose(&path, e.to_string(), diagnostics);
                    self.defaults.clone()
                }
            };
            self.store = Some(store);
        }
        self.store.as_mut()
    }

    fn persist(&self) -> Result<()> {
        let (Some(path), Some(store)) = (&self.path, &self.store) else {
            return Err(Error::LayerUnavailable(self.level));
        };
        atomic_write_json_pretty(path, &store.to_json_value())?;
        debug!(level = %self.level, path = %path.display(), "config written");
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigLayers {
    user: Layer,
    experiment: Layer,
    repository: Layer,
    default_experiments_root: PathBuf,
    diagnostics: Vec<ConfigDiagnostic>,
}

impl ConfigLayers {
    /// User layer at the lab home; experiment and repository layers start
    /// without a backing file until attached.
    pub fn new(home: &LabHome) -> Self {
        let default_root = home.default_experiments_root();
        let mut defaults = AttrNode::new();
        let _ = defaults.set(
            EXPERIMENTS_ROOT_KEY,
            default_root.to_string_lossy().to_string(),
        );
        Self {
            user: Layer::new(ConfigLevel::User, Some(home.config_path()), defaults),
            experiment: Layer::new(ConfigLevel::Experiment, None, AttrNode::new()),
            repository: Layer::new(ConfigLevel::Repository, None, AttrNode::new()),
            default_experiments_root: default_root,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_repository(mut self, repo_root: &Path) -> Self {
        self.attach(ConfigLevel::Repository, repo_config_path(repo_root));
        self
    }

    /// Points `level` at a new backing file; it is loaded on next access.
    pub fn attach(&mut self, level: ConfigLevel, path: PathBuf) {
        let layer = self.layer_mut(level);
        layer.path = Some(path);
        layer.store = None;
    }

    pub fn path(&self, level: ConfigLevel) -> Option<&Path> {
        self.layer(level).path.as_deref()
    }

    fn layer(&self, level: ConfigLevel) -> &Layer {
        match level {
            ConfigLevel::User => &self.user,
            ConfigLevel::Experiment => &self.experiment,
            ConfigLevel::Repository => &self.repository,
        }
    }

    fn layer_mut(&mut self, level: ConfigLevel) -> &mut Layer {
        self.split(level).0
    }

    fn split(&mut self, level: ConfigLevel) -> (&mut Layer, &mut Vec<ConfigDiagnostic>) {
        let layer = match level {
            ConfigLevel::User => &mut self.user,
            ConfigLevel::Experiment => &mut self.experiment,
            ConfigLevel::Repository => &mut self.repository,
        };
        (layer, &mut self.diagnostics)
    }

    fn store(&mut self, level: ConfigLevel) -> Option<&mut AttrNode> {
        let (layer, diagnostics) = self.split(level);
        layer.load(diagnostics)
    }

    /// The most specific layer that defines `key`.
    pub fn defining_level(&mut self, key: &str) -> Option<ConfigLevel> {
        ConfigLevel::PRECEDENCE.into_iter().find(|level| {
            self.store(*level)
                .map(|store| store.contains(key))
                .unwrap_or(false)
        })
    }

    /// Non-vivifying read through the precedence chain.
    pub fn lookup(&mut self, key: &str) -> Option<&AttrValue> {
        let level = self.defining_level(key)?;
        self.lookup_in(level, key)
    }

    pub fn lookup_in(&mut self, level: ConfigLevel, key: &str) -> Option<&AttrValue> {
        self.store(level)?.peek(key)
    }

    pub fn lookup_str(&mut self, key: &str) -> Option<String> {
        self.lookup(key).and_then(AttrValue::as_str).map(str::to_string)
    }

    /// Reads through the precedence chain; when no layer defines `key` an
    /// empty node is materialized in memory on the highest-precedence layer
    /// that has a backing file. Writes go through [`ConfigLayers::add_value`].
    pub fn get(&mut self, key: &str) -> Result<&AttrValue> {
        let level = match self.defining_level(key) {
            Some(level) => level,
            None => ConfigLevel::PRECEDENCE
                .into_iter()
                .find(|level| self.layer(*level).path.is_some())
                .unwrap_or(ConfigLevel::User),
        };
        let store = self.store(level).ok_or(Error::LayerUnavailable(level))?;
        Ok(&*store.get(key)?)
    }

    /// Writes `key` into `level` only and flushes that layer's file.
    pub fn add_value(
        &mut self,
        key: &str,
        value: impl Into<AttrValue>,
        level: ConfigLevel,
    ) -> Result<()> {
        let (layer, diagnostics) = self.split(level);
        let store = layer
            .load(diagnostics)
            .ok_or(Error::LayerUnavailable(level))?;
        store.set(key, value)?;
        layer.persist()
    }

    /// Snapshot of one layer's content.
    pub fn layer_items(&mut self, level: ConfigLevel) -> Option<AttrNode> {
        self.store(level).map(|store| store.clone())
    }

    /// All layers deep-merged, more specific scopes overlaid last.
    pub fn merged(&mut self) -> AttrNode {
        let mut merged = AttrNode::new();
        for level in ConfigLevel::PRECEDENCE.into_iter().rev() {
            if let Some(store) = self.store(level) {
                merged.deep_merge(store);
            }
        }
        merged
    }

    /// Root directory for all projects, read from the user layer. A missing or
    /// non-string entry is replaced by the default and persisted.
    pub fn experiments_root(&mut self) -> Result<PathBuf> {
        if let Some(root) = self
            .lookup_in(ConfigLevel::User, EXPERIMENTS_ROOT_KEY)
            .and_then(AttrValue::as_str)
        {
            return Ok(PathBuf::from(root));
        }
        let default_root = self.default_experiments_root.clone();
        self.add_value(
            EXPERIMENTS_ROOT_KEY,
            default_root.to_string_lossy().to_string(),
            ConfigLevel::User,
        )?;
        Ok(default_root)
    }

    pub fn diagnostics(&self) -> &[ConfigDiagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<ConfigDiagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}
