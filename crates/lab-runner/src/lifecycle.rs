//! One run of a host program: identity, directories, accumulated metadata
//! and the terminal write.
//!
//! A run goes `Created -> Active -> Ended`. It becomes active the first time
//! a directory is resolved and ends exactly once, through [`RunLifecycle::end`],
//! [`RunLifecycle::fail`], the [`RunLifecycle::scope`] boundary, or `Drop`.
//! Every mutation rewrites `info.json`; after the terminal write the file is
//! never touched again.

use chrono::Local;
use indexmap::IndexMap;
use lab_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, read_json_object, AttrNode,
    AttrValue,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigLayers, ConfigLevel};
use crate::error::{Error, Result};
use crate::paths::{LabHome, CONFIG_FILE, EXCEPTION_FILE, INFO_FILE};
use crate::registry::{RunRegistry, RunToken};
use crate::vcs::{Commit, GitCli, Repo, Vcs};

pub const DEFAULT_TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
pub const PROJECT_NAME_KEY: &str = "project_name";
pub const PROJECT_UUID_KEY: &str = "uuid";
const PROJECT_UUID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Active,
    Ended,
}

/// Why a run ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl RunFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }

    pub fn from_error<E: fmt::Debug + fmt::Display>(err: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name
            .split('<')
            .next()
            .and_then(|path| path.rsplit("::").next())
            .unwrap_or(type_name);
        Self::new(kind, err.to_string(), format!("{:?}", err))
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        let trace = format!("panic: {}", message);
        Self::new("panic", message, trace)
    }

    /// `kind: message`, as stored in the record's `exc_type`.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

/// The persisted `info.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub repo: String,
    pub argv: Vec<String>,
    pub exp_name: String,
    pub exp_dir: String,
    pub test_name: String,
    pub test_dir: String,
    pub root_dir: String,
    pub project_name: String,
    pub project_iname: String,
    pub project_dir: String,
    pub commit_hash: String,
    pub short_hash: String,
    pub dirs: Vec<String>,
    pub time_fmt: String,
    pub start_time: String,
    pub tags: IndexMap<String, Vec<String>>,
    pub plugins: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn read_run_record(run_dir: &Path) -> Result<RunRecord> {
    let path = run_dir.join(INFO_FILE);
    let map = read_json_object(&path)?.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found", path.display()),
        ))
    })?;
    Ok(serde_json::from_value(Value::Object(map)).map_err(lab_core::Error::from)?)
}

pub type ExitHook = Box<dyn FnOnce(&RunLifecycle, Option<&RunFailure>)>;

fn now_string(fmt: &str) -> String {
    let now = Local::now();
    let mut out = String::new();
    if write!(out, "{}", now.format(fmt)).is_err() {
        warn!(fmt, "invalid time format; using default");
        return now.format(DEFAULT_TIME_FMT).to_string();
    }
    out
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Value of `key` in the repository layer, created with `fresh` and
/// persisted there when missing.
fn ensure_identity(
    config: &mut ConfigLayers,
    key: &str,
    fresh: impl FnOnce() -> String,
) -> String {
    if let Some(existing) = config
        .lookup_in(ConfigLevel::Repository, key)
        .and_then(AttrValue::as_str)
        .filter(|s| !s.is_empty())
    {
        return existing.to_string();
    }
    let value = fresh();
    if let Err(e) = config.add_value(key, value.clone(), ConfigLevel::Repository) {
        warn!(key, error = %e, "could not persist project identity");
    }
    value
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub name: String,
    pub uuid: String,
}

impl ProjectIdentity {
    /// `<name>.<uuid>`, the project's directory and index key.
    pub fn key(&self) -> String {
        format!("{}.{}", self.name, self.uuid)
    }
}

/// Project name (defaults to the repository directory name) and uuid, read
/// from the repository layer and written there on first use.
pub fn resolve_identity(config: &mut ConfigLayers, repo: &Repo) -> ProjectIdentity {
    let name = ensure_identity(config, PROJECT_NAME_KEY, || {
        Some(base_name(&repo.working_dir))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "project".to_string())
    });
    let uuid = ensure_identity(config, PROJECT_UUID_KEY, || {
        Uuid::new_v4().simple().to_string()[..PROJECT_UUID_LEN].to_string()
    });
    ProjectIdentity { name, uuid }
}

pub struct RunBuilder {
    name: String,
    home: Option<LabHome>,
    registry: Option<RunRegistry>,
    vcs: Option<Box<dyn Vcs>>,
    argv: Option<Vec<String>>,
    time_fmt: String,
}

impl RunBuilder {
    pub fn home(mut self, home: LabHome) -> Self {
        self.home = Some(home);
        self
    }

    /// Shares sequence numbering with every other run using this registry.
    pub fn registry(mut self, registry: RunRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn vcs(mut self, vcs: impl Vcs + 'static) -> Self {
        self.vcs = Some(Box::new(vcs));
        self
    }

    pub fn argv<S: Into<String>>(mut self, argv: impl IntoIterator<Item = S>) -> Self {
        self.argv = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn time_fmt(mut self, fmt: impl Into<String>) -> Self {
        self.time_fmt = fmt.into();
        self
    }

    /// Resolves identity and directories, registers the run in the
    /// side-indexes and writes the first record. Index failures do not stop
    /// the run; see [`RunLifecycle::take_index_error`].
    pub fn start(self) -> Result<RunLifecycle> {
        let home = match (self.home, &self.registry) {
            (Some(home), _) => home,
            (None, Some(registry)) => registry.home().clone(),
            (None, None) => LabHome::discover()?,
        };
        let vcs: Box<dyn Vcs> = match self.vcs {
            Some(vcs) => vcs,
            None => Box::new(GitCli::from_current_dir()?),
        };
        let repo = vcs.load_repo()?;
        let commit = match vcs.commit(&repo) {
            Ok(commit) => commit,
            Err(e) => {
                warn!(error = %e, "commit unavailable; short hash left empty");
                None
            }
        };

        let mut config = ConfigLayers::new(&home).with_repository(&repo.working_dir);
        let registry = match self.registry {
            Some(registry) => registry,
            None => RunRegistry::from_config(home, &mut config)?,
        };
        let identity = resolve_identity(&mut config, &repo);
        let project_key = identity.key();
        let project_name = identity.name;
        let start_time = now_string(&self.time_fmt);

        let token = registry.issue_token();
        let mut run = RunLifecycle {
            name: self.name,
            token,
            registry,
            config,
            repo,
            commit,
            project_name,
            project_key,
            argv: self.argv.unwrap_or_else(|| std::env::args().collect()),
            time_fmt: self.time_fmt,
            start_time,
            end_time: None,
            tags: IndexMap::new(),
            plugins: IndexMap::new(),
            hold_dirs: Vec::new(),
            project_dir: None,
            exp_dir: None,
            run_dir: None,
            state: RunState::Created,
            end_code: None,
            failure: None,
            hooks: Vec::new(),
            finalized: false,
            index_error: None,
        };
        if let Err(e) = run.register() {
            warn!(run = %run.name, error = %e, "run index not updated");
            run.index_error = Some(e);
        }
        run.persist(Map::new())?;
        info!(run = %run.name, project = %run.project_key, "run started");
        Ok(run)
    }
}

pub struct RunLifecycle {
    name: String,
    token: RunToken,
    registry: RunRegistry,
    config: ConfigLayers,
    repo: Repo,
    commit: Option<Commit>,
    project_name: String,
    project_key: String,
    argv: Vec<String>,
    time_fmt: String,
    start_time: String,
    end_time: Option<String>,
    tags: IndexMap<String, Vec<String>>,
    plugins: IndexMap<String, Value>,
    hold_dirs: Vec<String>,
    project_dir: Option<PathBuf>,
    exp_dir: Option<PathBuf>,
    run_dir: Option<PathBuf>,
    state: RunState,
    end_code: Option<i32>,
    failure: Option<RunFailure>,
    hooks: Vec<ExitHook>,
    finalized: bool,
    index_error: Option<Error>,
}

impl fmt::Debug for RunLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLifecycle")
            .field("name", &self.name)
            .field("project_key", &self.project_key)
            .field("run_dir", &self.run_dir)
            .field("state", &self.state)
            .field("end_code", &self.end_code)
            .finish_non_exhaustive()
    }
}

impl RunLifecycle {
    pub fn builder(name: impl Into<String>) -> RunBuilder {
        RunBuilder {
            name: name.into(),
            home: None,
            registry: None,
            vcs: None,
            argv: None,
            time_fmt: DEFAULT_TIME_FMT.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn project_key(&self) -> &str {
        &self.project_key
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn commit_hash(&self) -> &str {
        self.commit.as_ref().map(|c| c.hexsha.as_str()).unwrap_or("")
    }

    pub fn short_hash(&self) -> &str {
        self.commit.as_ref().map(Commit::short).unwrap_or("")
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == RunState::Ended
    }

    pub fn end_code(&self) -> Option<i32> {
        self.end_code
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    pub fn tags(&self) -> &IndexMap<String, Vec<String>> {
        &self.tags
    }

    pub fn plugins(&self) -> &IndexMap<String, Value> {
        &self.plugins
    }

    /// The index error swallowed by `start`, if any.
    pub fn take_index_error(&mut self) -> Option<Error> {
        self.index_error.take()
    }

    /// Upserts the project and this run into the side-indexes. Returns
    /// whether the run list changed.
    pub fn register(&mut self) -> Result<bool> {
        self.registry.register_project(
            &self.project_key,
            &self.repo.working_dir,
            self.registry.experiments_root(),
        )?;
        self.registry.register_run(&self.project_key, &self.name)
    }

    fn activate(&mut self) {
        if self.state == RunState::Created {
            self.state = RunState::Active;
        }
    }

    pub fn project_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.project_dir {
            return Ok(dir.clone());
        }
        let dir = self.registry.resolve_project_dir(&self.project_key)?;
        self.config
            .attach(ConfigLevel::Experiment, dir.join(CONFIG_FILE));
        self.project_dir = Some(dir.clone());
        self.activate();
        Ok(dir)
    }

    pub fn exp_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.exp_dir {
            return Ok(dir.clone());
        }
        self.project_dir()?;
        let dir = self
            .registry
            .resolve_exp_dir(&self.project_key, &self.name)?;
        self.exp_dir = Some(dir.clone());
        Ok(dir)
    }

    pub fn run_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.run_dir {
            return Ok(dir.clone());
        }
        self.exp_dir()?;
        let commit = self.commit.as_ref().map(|c| c.hexsha.clone());
        let dir = self
            .registry
            .allocate_run_dir(self.token, &self.project_key, &self.name, commit.as_deref())?;
        self.run_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Directory name of the run, `NNNN.<short_hash>`.
    pub fn test_name(&mut self) -> Result<String> {
        Ok(base_name(&self.run_dir()?))
    }

    pub fn info_path(&mut self) -> Result<PathBuf> {
        Ok(self.run_dir()?.join(INFO_FILE))
    }

    /// Creates `<run dir>/<name>` and lists it in the record's `dirs`.
    pub fn make_run_dir(&mut self, name: &str) -> Result<PathBuf> {
        let dir = self.run_dir()?.join(name);
        ensure_dir(&dir)?;
        if !self.hold_dirs.iter().any(|held| held == name) {
            self.hold_dirs.push(name.to_string());
        }
        self.persist(Map::new())?;
        Ok(dir)
    }

    pub fn make_exp_dir(&mut self, name: &str) -> Result<PathBuf> {
        let dir = self.exp_dir()?.join(name);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    pub fn make_project_dir(&mut self, name: &str) -> Result<PathBuf> {
        let dir = self.project_dir()?.join(name);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    /// Associates a tag with the plugins it relates to.
    pub fn add_tag<S: Into<String>>(
        &mut self,
        name: &str,
        plugins: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        self.tags.insert(
            name.to_string(),
            plugins.into_iter().map(Into::into).collect(),
        );
        self.persist(Map::new())
    }

    /// Records a plugin invocation; `None` stores an empty object.
    pub fn add_plugin(&mut self, key: &str, value: Option<Value>) -> Result<()> {
        self.plugins.insert(
            key.to_string(),
            value.unwrap_or_else(|| Value::Object(Map::new())),
        );
        self.persist(Map::new())
    }

    pub fn config(&mut self) -> &mut ConfigLayers {
        &mut self.config
    }

    pub fn config_get(&mut self, key: &str) -> Result<&AttrValue> {
        self.config.get(key)
    }

    pub fn config_lookup(&mut self, key: &str) -> Option<&AttrValue> {
        self.config.lookup(key)
    }

    pub fn add_config(
        &mut self,
        key: &str,
        value: impl Into<AttrValue>,
        level: ConfigLevel,
    ) -> Result<()> {
        if level == ConfigLevel::Experiment {
            self.project_dir()?;
        }
        self.config.add_value(key, value, level)
    }

    pub fn config_items(&mut self) -> AttrNode {
        self.config.merged()
    }

    fn record(&mut self) -> Result<RunRecord> {
        let run_dir = self.run_dir()?;
        let exp_dir = self.exp_dir()?;
        let project_dir = self.project_dir()?;
        Ok(RunRecord {
            repo: path_string(&self.repo.working_dir),
            argv: self.argv.clone(),
            exp_name: self.name.clone(),
            exp_dir: path_string(&exp_dir),
            test_name: base_name(&run_dir),
            test_dir: path_string(&run_dir),
            root_dir: path_string(self.registry.experiments_root()),
            project_name: self.project_name.clone(),
            project_iname: base_name(&project_dir),
            project_dir: path_string(&project_dir),
            commit_hash: self.commit_hash().to_string(),
            short_hash: self.short_hash().to_string(),
            dirs: self.hold_dirs.clone(),
            time_fmt: self.time_fmt.clone(),
            start_time: self.start_time.clone(),
            tags: self.tags.clone(),
            plugins: self.plugins.clone(),
            end_time: self.end_time.clone(),
            end_code: self.end_code,
            exc_type: self.failure.as_ref().map(RunFailure::summary),
            extra: Map::new(),
        })
    }

    /// Overwrites `info.json` with the current state plus `extra`. No-op once
    /// the run has ended.
    pub(crate) fn persist(&mut self, extra: Map<String, Value>) -> Result<()> {
        if self.is_ended() {
            debug!(run = %self.name, "run ended; record left unchanged");
            return Ok(());
        }
        let record = self.record()?;
        let mut doc = serde_json::to_value(&record).map_err(lab_core::Error::from)?;
        if let Value::Object(map) = &mut doc {
            for (key, value) in extra {
                map.insert(key, value);
            }
        }
        atomic_write_json_pretty(&self.info_path()?, &doc)?;
        Ok(())
    }

    /// Terminal write. Only the first call has any effect.
    pub fn end(&mut self, end_code: i32, extra: Map<String, Value>) -> Result<()> {
        if self.is_ended() {
            debug!(run = %self.name, end_code, "run already ended; ignoring");
            return Ok(());
        }
        self.end_time = Some(now_string(&self.time_fmt));
        self.end_code = Some(end_code);
        let written = self.persist(extra);
        self.state = RunState::Ended;
        self.registry.release_run(self.token);
        info!(run = %self.name, end_code, "run ended");
        written
    }

    /// Records an abnormal end: the trace goes to `exception.log` in the run
    /// directory and to stderr, the record gets `end_code = 1` and `exc_type`.
    /// No-op once the run has ended.
    pub fn fail(&mut self, failure: RunFailure) -> Result<()> {
        if self.is_ended() {
            debug!(run = %self.name, kind = %failure.kind, "run already ended; failure ignored");
            return Ok(());
        }
        let written = self
            .run_dir()
            .and_then(|dir| {
                atomic_write_bytes(&dir.join(EXCEPTION_FILE), failure.trace.as_bytes())
                    .map_err(Error::from)
            });
        error!(run = %self.name, kind = %failure.kind, "run failed: {}", failure.message);
        eprintln!("{}", failure.trace);
        self.failure = Some(failure);
        let ended = self.end(1, Map::new());
        written.and(ended)
    }

    /// Called with the run and its failure, if any, when the run is finalized.
    pub fn register_exit_hook(
        &mut self,
        hook: impl FnOnce(&RunLifecycle, Option<&RunFailure>) + 'static,
    ) {
        self.hooks.push(Box::new(hook));
    }

    /// Ends a still-running run with code 0, then runs the exit hooks. Only
    /// the first call does anything.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if !self.is_ended() {
            if let Err(e) = self.end(0, Map::new()) {
                warn!(run = %self.name, error = %e, "final record not written");
            }
        }
        let hooks = std::mem::take(&mut self.hooks);
        for hook in hooks {
            hook(&*self, self.failure.as_ref());
        }
    }

    fn record_failure(&mut self, failure: RunFailure) {
        if let Err(e) = self.fail(failure) {
            warn!(run = %self.name, error = %e, "failure not fully recorded");
        }
    }

    /// Top-level error boundary for the host program. An `Err` from `body` or
    /// a panic is recorded as the run's failure; the run is then finalized.
    /// Errors are returned and panics resumed after recording.
    pub fn scope<T, E, F>(&mut self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut RunLifecycle) -> std::result::Result<T, E>,
        E: fmt::Debug + fmt::Display,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        match outcome {
            Ok(Ok(value)) => {
                self.finalize();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(RunFailure::from_error(&err));
                self.finalize();
                Err(err)
            }
            Err(payload) => {
                self.record_failure(RunFailure::from_panic(payload.as_ref()));
                self.finalize();
                panic::resume_unwind(payload)
            }
        }
    }
}

impl Drop for RunLifecycle {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if std::thread::panicking() && !self.is_ended() {
            let message = "thread panicked while the run was active";
            self.record_failure(RunFailure::new("panic", message, message));
        }
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::repo_config_path;
    use crate::test_support::temp_root;
    use crate::vcs::Detached;
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;

    struct Fixture {
        root: PathBuf,
        home: LabHome,
        repo: PathBuf,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let root = temp_root(tag);
            let repo = root.join("repo");
            ensure_dir(&repo).expect("repo");
            Self {
                home: LabHome::at(root.join("home")),
                repo,
                root,
            }
        }

        fn start(&self, name: &str, commit: Option<&str>) -> RunLifecycle {
            RunLifecycle::builder(name)
                .home(self.home.clone())
                .vcs(Detached::new(&self.repo, commit))
                .argv(["train", "--epochs=1"])
                .start()
                .expect("start")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn info(run: &mut RunLifecycle) -> Value {
        let path = run.info_path().expect("info path");
        serde_json::from_slice(&fs::read(path).expect("read info")).expect("json")
    }

    #[test]
    fn fresh_project_run_is_named_from_sequence_and_commit() {
        let fx = Fixture::new("scenario");
        let mut run = fx.start("demo", Some("deadbeefcafef00d"));
        assert_eq!(run.test_name().expect("name"), "0001.deadbeef");
        assert_eq!(run.state(), RunState::Active);

        let doc = info(&mut run);
        assert_eq!(doc["test_name"], json!("0001.deadbeef"));
        assert_eq!(doc["exp_name"], json!("demo"));
        assert_eq!(doc["commit_hash"], json!("deadbeefcafef00d"));
        assert_eq!(doc["short_hash"], json!("deadbeef"));
        assert_eq!(doc["argv"], json!(["train", "--epochs=1"]));
        assert_eq!(doc["repo"], json!(fx.repo.to_string_lossy()));
        assert_eq!(doc["project_name"], json!("repo"));
        assert_eq!(doc["project_iname"], json!(run.project_key()));
        assert_eq!(doc["time_fmt"], json!(DEFAULT_TIME_FMT));
        assert!(doc.get("end_time").is_none());
        assert!(doc.get("end_code").is_none());
        run.end(0, Map::new()).expect("end");
    }

    #[test]
    fn identity_is_persisted_in_repository_config() {
        let fx = Fixture::new("identity");
        let key = {
            let run = fx.start("demo", None);
            run.project_key().to_string()
        };
        let repo_cfg: Value =
            serde_json::from_slice(&fs::read(repo_config_path(&fx.repo)).expect("repo cfg"))
                .expect("json");
        let uuid = repo_cfg[PROJECT_UUID_KEY].as_str().expect("uuid").to_string();
        assert_eq!(uuid.len(), PROJECT_UUID_LEN);
        assert_eq!(key, format!("repo.{}", uuid));

        let second = fx.start("demo", None);
        assert_eq!(second.project_key(), key);
    }

    #[test]
    fn missing_commit_leaves_short_hash_empty() {
        let fx = Fixture::new("no_commit");
        let mut run = fx.start("demo", None);
        assert_eq!(run.test_name().expect("name"), "0001.");
        assert_eq!(info(&mut run)["short_hash"], json!(""));
    }

    #[test]
    fn end_is_recorded_once() {
        let fx = Fixture::new("end_twice");
        let mut run = fx.start("demo", Some("deadbeef"));
        let mut extra = Map::new();
        extra.insert("note".into(), json!("first"));
        run.end(3, extra).expect("end");
        let first = info(&mut run);
        assert_eq!(first["end_code"], json!(3));
        assert_eq!(first["note"], json!("first"));

        std::thread::sleep(std::time::Duration::from_millis(1100));
        run.end(0, Map::new()).expect("second end is a no-op");
        let second = info(&mut run);
        assert_eq!(second["end_code"], json!(3));
        assert_eq!(second["end_time"], first["end_time"]);
        assert_eq!(run.end_code(), Some(3));
    }

    #[test]
    fn mutations_flush_until_the_run_ends() {
        let fx = Fixture::new("mutations");
        let mut run = fx.start("demo", Some("deadbeef"));
        run.add_plugin("saver", None).expect("plugin");
        run.add_plugin("logger", Some(json!({"level": "info"}))).expect("plugin");
        run.add_tag("best", ["saver"]).expect("tag");
        let doc = info(&mut run);
        assert_eq!(doc["plugins"], json!({"saver": {}, "logger": {"level": "info"}}));
        assert_eq!(doc["tags"], json!({"best": ["saver"]}));

        run.end(0, Map::new()).expect("end");
        let ended = info(&mut run);
        run.add_tag("late", Vec::<String>::new()).expect("ignored");
        run.add_plugin("late", None).expect("ignored");
        run.make_run_dir("late_dir").expect("dir still created");
        assert_eq!(info(&mut run), ended);
        assert!(run.tags().contains_key("late"));
    }

    #[test]
    fn run_dirs_are_listed_once() {
        let fx = Fixture::new("dirs");
        let mut run = fx.start("demo", Some("deadbeef"));
        let ckpt = run.make_run_dir("checkpoints").expect("dir");
        run.make_run_dir("checkpoints").expect("again");
        run.make_run_dir("logs").expect("dir");
        assert!(ckpt.is_dir());
        assert_eq!(info(&mut run)["dirs"], json!(["checkpoints", "logs"]));

        let shared = run.make_project_dir("datasets").expect("project dir");
        assert_eq!(shared.parent(), Some(run.project_dir().expect("project").as_path()));
        let exp_level = run.make_exp_dir("cache").expect("exp dir");
        assert_eq!(exp_level.parent(), Some(run.exp_dir().expect("exp").as_path()));
        assert_eq!(info(&mut run)["dirs"], json!(["checkpoints", "logs"]));
    }

    #[test]
    fn failure_writes_trace_and_freezes_record() {
        let fx = Fixture::new("failure");
        let mut run = fx.start("demo", Some("deadbeef"));
        run.fail(RunFailure::new(
            "ValueError",
            "loss is nan",
            "Traceback:\n  step 12\nValueError: loss is nan",
        ))
        .expect("fail");

        let run_dir = run.run_dir().expect("dir");
        let trace = fs::read_to_string(run_dir.join(EXCEPTION_FILE)).expect("trace");
        assert!(trace.contains("step 12"));
        let doc = info(&mut run);
        assert_eq!(doc["end_code"], json!(1));
        assert_eq!(doc["exc_type"], json!("ValueError: loss is nan"));

        run.add_tag("after", ["x"]).expect("ignored");
        run.add_plugin("after", None).expect("ignored");
        assert_eq!(info(&mut run), doc);
        assert_eq!(run.failure().map(|f| f.kind.as_str()), Some("ValueError"));
    }

    #[test]
    fn drop_finalizes_with_success_and_runs_hooks_once() {
        let fx = Fixture::new("drop");
        let seen: Rc<RefCell<Vec<(Option<i32>, bool)>>> = Rc::default();
        let run_dir = {
            let mut run = fx.start("demo", Some("deadbeef"));
            let sink = seen.clone();
            run.register_exit_hook(move |run, failure| {
                sink.borrow_mut().push((run.end_code(), failure.is_some()));
            });
            run.run_dir().expect("dir")
        };
        assert_eq!(*seen.borrow(), vec![(Some(0), false)]);
        let record = read_run_record(&run_dir).expect("record");
        assert_eq!(record.end_code, Some(0));
        assert!(record.end_time.is_some());
        assert!(record.exc_type.is_none());
    }

    #[test]
    fn scope_records_errors_and_returns_them() {
        let fx = Fixture::new("scope_err");
        let mut run = fx.start("demo", Some("deadbeef"));
        let seen: Rc<RefCell<Option<String>>> = Rc::default();
        let sink = seen.clone();
        run.register_exit_hook(move |_, failure| {
            *sink.borrow_mut() = failure.map(RunFailure::summary);
        });
        let result: std::result::Result<(), Error> =
            run.scope(|_| Err(Error::Vcs("remote unreachable".into())));
        assert!(result.is_err());
        assert_eq!(run.end_code(), Some(1));
        let doc = info(&mut run);
        assert_eq!(doc["end_code"], json!(1));
        assert_eq!(doc["exc_type"], json!("Error: git: remote unreachable"));
        assert_eq!(seen.borrow().as_deref(), Some("Error: git: remote unreachable"));
    }

    #[test]
    fn scope_success_ends_with_zero() {
        let fx = Fixture::new("scope_ok");
        let mut run = fx.start("demo", Some("deadbeef"));
        let value: std::result::Result<u32, Error> = run.scope(|run| {
            run.add_plugin("trainer", None)?;
            Ok(7)
        });
        assert_eq!(value.expect("ok"), 7);
        assert_eq!(run.end_code(), Some(0));
        assert!(info(&mut run)["plugins"].get("trainer").is_some());
    }

    #[test]
    fn scope_records_panics_and_resumes_them() {
        let fx = Fixture::new("scope_panic");
        let mut run = fx.start("demo", Some("deadbeef"));
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: std::result::Result<(), Error> = run.scope(|_| panic!("diverged at step 3"));
        }));
        assert!(caught.is_err());
        assert_eq!(run.end_code(), Some(1));
        let doc = info(&mut run);
        assert_eq!(doc["exc_type"], json!("panic: diverged at step 3"));
        let run_dir = run.run_dir().expect("dir");
        assert!(fs::read_to_string(run_dir.join(EXCEPTION_FILE))
            .expect("trace")
            .contains("diverged at step 3"));
    }

    #[test]
    fn drop_during_panic_marks_failure() {
        let fx = Fixture::new("drop_panic");
        let run_dir = Rc::new(RefCell::new(None));
        let slot = run_dir.clone();
        let home = fx.home.clone();
        let repo = fx.repo.clone();
        let caught = panic::catch_unwind(AssertUnwindSafe(move || {
            let mut run = RunLifecycle::builder("demo")
                .home(home)
                .vcs(Detached::new(repo, Some("deadbeef")))
                .argv(["host"])
                .start()
                .expect("start");
            *slot.borrow_mut() = Some(run.run_dir().expect("dir"));
            panic!("host crashed");
        }));
        assert!(caught.is_err());
        let dir = run_dir.borrow().clone().expect("dir recorded");
        let record = read_run_record(&dir).expect("record");
        assert_eq!(record.end_code, Some(1));
        assert_eq!(
            record.exc_type.as_deref(),
            Some("panic: thread panicked while the run was active")
        );
    }

    #[test]
    fn failure_after_end_changes_nothing() {
        let fx = Fixture::new("late_failure");
        let seen: Rc<RefCell<Option<bool>>> = Rc::default();
        let mut run = fx.start("demo", Some("deadbeef"));
        let sink = seen.clone();
        run.register_exit_hook(move |_, failure| {
            *sink.borrow_mut() = Some(failure.is_some());
        });
        run.end(0, Map::new()).expect("end");
        let ended = info(&mut run);

        run.fail(RunFailure::new("Error", "late", "late trace"))
            .expect("ignored");
        assert_eq!(run.end_code(), Some(0));
        assert!(run.failure().is_none());
        let run_dir = run.run_dir().expect("dir");
        assert!(!run_dir.join(EXCEPTION_FILE).exists());
        assert_eq!(info(&mut run), ended);

        run.finalize();
        assert_eq!(*seen.borrow(), Some(false));
    }

    #[test]
    fn live_runs_with_the_same_name_keep_separate_records() {
        let fx = Fixture::new("same_name");
        let registry = RunRegistry::new(fx.home.clone(), fx.home.default_experiments_root());
        let start = || {
            RunLifecycle::builder("sweep")
                .registry(registry.clone())
                .vcs(Detached::new(&fx.repo, Some("deadbeef")))
                .argv(["host"])
                .start()
                .expect("start")
        };
        let mut a = start();
        let mut b = start();
        let (dir_a, dir_b) = (a.run_dir().expect("a"), b.run_dir().expect("b"));
        assert_ne!(dir_a, dir_b);
        assert_eq!(a.test_name().expect("a"), "0001.deadbeef");
        assert_eq!(b.test_name().expect("b"), "0002.deadbeef");

        a.add_plugin("lr", Some(json!(0.1))).expect("a plugin");
        b.add_plugin("lr", Some(json!(0.2))).expect("b plugin");
        assert_eq!(info(&mut a)["plugins"], json!({"lr": 0.1}));
        assert_eq!(info(&mut b)["plugins"], json!({"lr": 0.2}));
    }

    #[test]
    fn runs_in_one_process_share_the_sequence() {
        let fx = Fixture::new("shared_seq");
        let registry = RunRegistry::new(fx.home.clone(), fx.home.default_experiments_root());
        let names: Vec<String> = ["demo", "demo", "ablation"]
            .iter()
            .map(|name| {
                let mut run = RunLifecycle::builder(*name)
                    .registry(registry.clone())
                    .vcs(Detached::new(&fx.repo, Some("deadbeef")))
                    .argv(["host"])
                    .start()
                    .expect("start");
                let test_name = run.test_name().expect("name");
                run.end(0, Map::new()).expect("end");
                test_name
            })
            .collect();
        assert_eq!(names, vec!["0001.deadbeef", "0002.deadbeef", "0003.deadbeef"]);
        assert_eq!(registry.allocated_runs(), names);
    }

    #[test]
    fn index_failures_do_not_block_the_run() {
        let fx = Fixture::new("index_error");
        ensure_dir(fx.home.root()).expect("home");
        fs::write(fx.home.index_path(), b"[not an object]").expect("seed");
        let mut run = fx.start("demo", Some("deadbeef"));
        assert!(matches!(run.take_index_error(), Some(Error::Index { .. })));
        assert!(run.take_index_error().is_none());
        run.add_tag("still", ["works"]).expect("tag");
        assert_eq!(info(&mut run)["tags"], json!({"still": ["works"]}));
    }

    #[test]
    fn config_writes_follow_the_named_level() {
        let fx = Fixture::new("config");
        let mut run = fx.start("demo", Some("deadbeef"));
        run.add_config("optim.lr", 0.01, ConfigLevel::Experiment)
            .expect("experiment write");
        run.add_config("optim.lr", 0.1, ConfigLevel::User).expect("user write");
        assert_eq!(
            run.config_lookup("optim.lr").and_then(AttrValue::as_f64),
            Some(0.01)
        );
        let exp_file = run.project_dir().expect("project").join(CONFIG_FILE);
        let exp_cfg: Value = serde_json::from_slice(&fs::read(exp_file).expect("read")).expect("json");
        assert_eq!(exp_cfg, json!({"optim": {"lr": 0.01}}));
        let items = run.config_items();
        assert!(items.contains("experiments_root"));
        assert!(items.contains(PROJECT_UUID_KEY));
        assert!(run.config_get("not.set").expect("vivify").is_empty_node());
    }

    #[test]
    fn failure_kind_comes_from_the_error_type() {
        let failure = RunFailure::from_error(&std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        ));
        assert_eq!(failure.kind, "Error");
        assert_eq!(failure.summary(), "Error: disk full");
        let panic = RunFailure::from_panic(&"boom");
        assert_eq!(panic.summary(), "panic: boom");
    }
}
