//! Seam to the version-control collaborator. Runs only need a working
//! directory and, when available, the commit the code was run at.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{Error, Result};

pub const SHORT_HASH_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hexsha: String,
}

impl Commit {
    pub fn new(hexsha: impl Into<String>) -> Self {
        Self {
            hexsha: hexsha.into(),
        }
    }

    pub fn short(&self) -> &str {
        short_hash(&self.hexsha)
    }
}

/// First [`SHORT_HASH_LEN`] characters of a commit hash.
pub fn short_hash(hexsha: &str) -> &str {
    match hexsha.char_indices().nth(SHORT_HASH_LEN) {
        Some((idx, _)) => &hexsha[..idx],
        None => hexsha,
    }
}

pub trait Vcs {
    fn load_repo(&self) -> Result<Repo>;
    fn commit(&self, repo: &Repo) -> Result<Option<Commit>>;
}

/// Reads repository facts through the `git` executable. Outside a repository
/// the start directory stands in for the working dir and there is no commit.
#[derive(Debug, Clone)]
pub struct GitCli {
    start_dir: PathBuf,
}

impl GitCli {
    pub fn new(start_dir: impl Into<PathBuf>) -> Self {
        Self {
            start_dir: start_dir.into(),
        }
    }

    pub fn from_current_dir() -> Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    fn rev_parse(&self, dir: &Path, arg: &str) -> Result<Option<String>> {
        let output = Command::new("git")
            .arg("rev-parse")
            .arg(arg)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Vcs(format!("failed to spawn git: {}", e)))?;
        if !output.status.success() {
            debug!(
                arg,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git rev-parse failed"
            );
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if text.is_empty() { None } else { Some(text) })
    }
}

impl Vcs for GitCli {
    fn load_repo(&self) -> Result<Repo> {
        let working_dir = match self.rev_parse(&self.start_dir, "--show-toplevel") {
            Ok(Some(top)) => PathBuf::from(top),
            Ok(None) | Err(_) => self.start_dir.clone(),
        };
        Ok(Repo { working_dir })
    }

    fn commit(&self, repo: &Repo) -> Result<Option<Commit>> {
        Ok(self
            .rev_parse(&repo.working_dir, "HEAD")?
            .map(Commit::new))
    }
}

/// Fixed repository facts for hosts without git.
#[derive(Debug, Clone)]
pub struct Detached {
    working_dir: PathBuf,
    commit: Option<String>,
}

impl Detached {
    pub fn new(working_dir: impl Into<PathBuf>, commit: Option<&str>) -> Self {
        Self {
            working_dir: working_dir.into(),
            commit: commit.map(str::to_string),
        }
    }
}

impl Vcs for Detached {
    fn load_repo(&self) -> Result<Repo> {
        Ok(Repo {
            working_dir: self.working_dir.clone(),
        })
    }

    fn commit(&self, _repo: &Repo) -> Result<Option<Commit>> {
        Ok(self.commit.clone().map(Commit::new))
    }
}
