use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A dot-path crosses a value that is not a node.
    #[error("path '{path}' is blocked: segment '{segment}' holds a non-node value")]
    NotANode { path: String, segment: String },

    #[error("expected a JSON object in {0}")]
    NotAnObject(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
