//! Core building blocks shared by the lab crates: the nested attribute store
//! and the file helpers used to persist it.

pub mod attr;
pub mod error;
pub mod fs;

pub use attr::{AttrNode, AttrValue, Walk};
pub use error::{Error, Result};
pub use fs::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, read_json_object};
