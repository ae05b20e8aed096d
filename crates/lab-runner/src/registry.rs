//! Run directory allocation and the side-indexes used to discover runs.
//!
//! Layout under the experiments root:
//!
//! ```text
//! <experiments_root>/<project_key>/<run_name>/<NNNN>.<short_hash>/info.json
//!                                            /.seq/<NNNN>
//! ```
//!
//! Sequence numbers are unique per run-name directory. The first allocation
//! in a registry scans the directory; later ones continue from the in-memory
//! counter. Whatever the candidate, a number is only claimed by exclusively
//! creating its `.seq/NNNN` marker, so concurrent launches against the same
//! directory probe past each other instead of sharing a number.
//!
//! The side-indexes are read-modify-write JSON files without locking: they
//! help tools locate runs and are not a source of truth.

use indexmap::IndexMap;
use lab_core::{atomic_write_json_pretty, ensure_dir, read_json_object};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ConfigLayers;
use crate::error::{Error, Result};
use crate::paths::{repo_index_path, LabHome};
use crate::vcs::{short_hash, SHORT_HASH_LEN};

pub const SEQ_RESERVE_DIR: &str = ".seq";

/// Identifies one run within a registry; allocations are idempotent per token.
pub type RunToken = u64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub repopath: String,
    #[serde(default)]
    pub exp_root: String,
    #[serde(default)]
    pub exps: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Project key -> discovery metadata.
pub type SideIndex = IndexMap<String, IndexEntry>;

pub fn run_dir_name(seq: u32, short: &str) -> String {
    format!("{:04}.{}", seq, short)
}

/// `NNNN.<hex>` with at most [`SHORT_HASH_LEN`] hex characters (possibly none).
pub fn is_run_dir_name(name: &str) -> bool {
    let Some((seq, hash)) = name.split_once('.') else {
        return false;
    };
    seq.len() == 4
        && seq.bytes().all(|b| b.is_ascii_digit())
        && hash.len() <= SHORT_HASH_LEN
        && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

/// Picks the first free number at or above the candidate and claims it.
fn claim_sequence(exp_dir: &Path, last_seq: Option<u32>, short: &str) -> Result<(u32, PathBuf)> {
    let names = list_names(exp_dir)?;
    let reserve_dir = exp_dir.join(SEQ_RESERVE_DIR);
    ensure_dir(&reserve_dir)?;

    let mut taken: HashSet<String> = names
        .iter()
        .filter_map(|name| name.split('.').next())
        .map(str::to_string)
        .collect();
    taken.extend(list_names(&reserve_dir)?);

    let mut seq = match last_seq {
        Some(last) => last + 1,
        None => names.iter().filter(|name| is_run_dir_name(name)).count() as u32 + 1,
    };
    loop {
        let prefix = format!("{:04}", seq);
        if taken.contains(&prefix) {
            seq += 1;
            continue;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(reserve_dir.join(&prefix))
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(seq, dir = %exp_dir.display(), "sequence claimed concurrently; probing next");
                seq += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        let dir = exp_dir.join(run_dir_name(seq, short));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((seq, dir)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(seq, dir = %dir.display(), "run directory already present; probing next");
                seq += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn load_index(path: &Path) -> Result<SideIndex> {
    let index_error = |message: String| Error::Index {
        path: path.to_path_buf(),
        message,
    };
    match read_json_object(path).map_err(|e| index_error(e.to_string()))? {
        None => Ok(SideIndex::new()),
        Some(map) => {
            serde_json::from_value(Value::Object(map)).map_err(|e| index_error(e.to_string()))
        }
    }
}

fn write_index(path: &Path, index: &SideIndex) -> Result<()> {
    let value = serde_json::to_value(index).map_err(lab_core::Error::from)?;
    atomic_write_json_pretty(path, &value)?;
    Ok(())
}

fn upsert(index: &mut SideIndex, project_key: &str, repopath: &str, exp_root: &str) {
    let entry = index.entry(project_key.to_string()).or_default();
    entry.repopath = repopath.to_string();
    entry.exp_root = exp_root.to_string();
}

fn append_run(index: &mut SideIndex, project_key: &str, repopath: &Path, run_name: &str) -> bool {
    let entry = index
        .entry(project_key.to_string())
        .or_insert_with(|| IndexEntry {
            repopath: repopath.to_string_lossy().to_string(),
            ..IndexEntry::default()
        });
    if entry.exps.iter().any(|name| name == run_name) {
        return false;
    }
    entry.exps.push(run_name.to_string());
    true
}

#[derive(Debug, Default)]
struct RegistryState {
    last_seq: Option<u32>,
    next_token: RunToken,
    allocated: HashMap<RunToken, PathBuf>,
    runs: Vec<String>,
    repos: HashMap<String, PathBuf>,
}

/// Shared handle; clones see the same counter and allocations.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    home: LabHome,
    experiments_root: PathBuf,
    state: Arc<Mutex<RegistryState>>,
}

impl RunRegistry {
    pub fn new(home: LabHome, experiments_root: impl Into<PathBuf>) -> Self {
        Self {
            home,
            experiments_root: experiments_root.into(),
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    /// Registry rooted at the configured experiments root.
    pub fn from_config(home: LabHome, config: &mut ConfigLayers) -> Result<Self> {
        let root = config.experiments_root()?;
        Ok(Self::new(home, root))
    }

    pub fn home(&self) -> &LabHome {
        &self.home
    }

    pub fn experiments_root(&self) -> &Path {
        &self.experiments_root
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resolve_project_dir(&self, project_key: &str) -> Result<PathBuf> {
        let dir = self.experiments_root.join(project_key);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    pub fn resolve_exp_dir(&self, project_key: &str, run_name: &str) -> Result<PathBuf> {
        let dir = self.resolve_project_dir(project_key)?.join(run_name);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    /// A token no other run of this registry holds.
    pub fn issue_token(&self) -> RunToken {
        let mut state = self.lock();
        state.next_token += 1;
        state.next_token
    }

    /// Allocates `<project>/<run_name>/NNNN.<short_hash>`. Repeated calls with
    /// the same token return the same directory until the token is released;
    /// distinct tokens never share a directory, whatever their run name.
    pub fn allocate_run_dir(
        &self,
        token: RunToken,
        project_key: &str,
        run_name: &str,
        commit_hash: Option<&str>,
    ) -> Result<PathBuf> {
        let mut state = self.lock();
        if let Some(dir) = state.allocated.get(&token) {
            return Ok(dir.clone());
        }
        let exp_dir = self.resolve_exp_dir(project_key, run_name)?;
        let short = commit_hash.map(short_hash).unwrap_or("");
        let (seq, dir) = claim_sequence(&exp_dir, state.last_seq, short)?;
        debug!(project_key, run_name, token, seq, dir = %dir.display(), "allocated run directory");
        state.last_seq = Some(seq);
        state.allocated.insert(token, dir.clone());
        state.runs.push(run_dir_name(seq, short));
        Ok(dir)
    }

    /// Forgets the token's allocation. The sequence counter keeps counting.
    pub fn release_run(&self, token: RunToken) {
        self.lock().allocated.remove(&token);
    }

    /// Names of every run directory allocated through this registry.
    pub fn allocated_runs(&self) -> Vec<String> {
        self.lock().runs.clone()
    }

    /// Upserts the project into the global and the repository-local index.
    /// A local index that only knows other projects is stale and is rewritten
    /// to hold the current project, carrying over its first entry.
    pub fn register_project(
        &self,
        project_key: &str,
        repo_path: &Path,
        experiments_root: &Path,
    ) -> Result<()> {
        let repopath = repo_path.to_string_lossy().to_string();
        let exp_root = experiments_root.to_string_lossy().to_string();

        let global_path = self.home.index_path();
        let mut global = load_index(&global_path)?;
        upsert(&mut global, project_key, &repopath, &exp_root);
        write_index(&global_path, &global)?;

        let local_path = repo_index_path(repo_path);
        let mut local = load_index(&local_path)?;
        if !local.is_empty() && !local.contains_key(project_key) {
            warn!(
                path = %local_path.display(),
                project_key,
                "repository index references other projects; rewriting"
            );
            let carried = local.shift_remove_index(0).map(|(_, entry)| entry);
            local = SideIndex::new();
            if let Some(entry) = carried {
                local.insert(project_key.to_string(), entry);
            }
        }
        upsert(&mut local, project_key, &repopath, &exp_root);
        write_index(&local_path, &local)?;

        self.lock()
            .repos
            .insert(project_key.to_string(), repo_path.to_path_buf());
        debug!(project_key, repo = %repo_path.display(), "registered project");
        Ok(())
    }

    /// Appends `run_name` to the project's `exps` list in the repository
    /// index (mirrored into the global index). Returns whether anything
    /// changed.
    pub fn register_run(&self, project_key: &str, run_name: &str) -> Result<bool> {
        let repo = self
            .lock()
            .repos
            .get(project_key)
            .cloned()
            .ok_or_else(|| Error::UnknownProject(project_key.to_string()))?;

        let local_path = repo_index_path(&repo);
        let mut local = load_index(&local_path)?;
        let local_changed = append_run(&mut local, project_key, &repo, run_name);
        if local_changed {
            write_index(&local_path, &local)?;
        }

        let global_path = self.home.index_path();
        let mut global = load_index(&global_path)?;
        let global_changed = append_run(&mut global, project_key, &repo, run_name);
        if global_changed {
            write_index(&global_path, &global)?;
        }
        Ok(local_changed || global_changed)
    }

    /// Contents of the global side-index.
    pub fn projects(&self) -> Result<SideIndex> {
        load_index(&self.home.index_path())
    }

    /// Run directories whose name starts with `name`, in path order.
    pub fn find_runs(&self, name: &str) -> Result<Vec<PathBuf>> {
        if !self.experiments_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.experiments_root)
            .min_depth(3)
            .max_depth(3)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let matched = {
                let file_name = entry.file_name().to_string_lossy();
                is_run_dir_name(&file_name) && file_name.starts_with(name)
            };
            if matched {
                found.push(entry.into_path());
            }
        }
        Ok(found)
    }
}
