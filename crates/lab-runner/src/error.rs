use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigLevel;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] lab_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A side-index file could not be read or parsed; it is left untouched.
    #[error("side-index {} is unusable: {}", .path.display(), .message)]
    Index { path: PathBuf, message: String },

    #[error("config layer '{0}' has no backing file")]
    LayerUnavailable(ConfigLevel),

    #[error("unknown config level '{0}' (expected user, experiment or repository)")]
    UnknownLevel(String),

    #[error("project '{0}' is not registered in this process")]
    UnknownProject(String),

    #[error("could not resolve a home directory; set LAB_HOME")]
    NoHome,

    #[error("git: {0}")]
    Vcs(String),
}
