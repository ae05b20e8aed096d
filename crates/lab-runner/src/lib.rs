//! Run bookkeeping for experiment hosts: layered configuration, run
//! directory allocation, side-indexes and the per-run metadata record.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod paths;
pub mod registry;
pub mod vcs;

pub use config::{ConfigDiagnostic, ConfigLayers, ConfigLevel};
pub use error::{Error, Result};
pub use lifecycle::{
    read_run_record, resolve_identity, ProjectIdentity, RunBuilder, RunFailure, RunLifecycle,
    RunRecord, RunState, DEFAULT_TIME_FMT,
};
pub use paths::LabHome;
pub use registry::{IndexEntry, RunRegistry, SideIndex};
pub use vcs::{Commit, Detached, GitCli, Repo, Vcs};
