mod dir_tree;
mod remove;
mod request;
mod session;
mod spec_file;

pub use dir_tree::DirTree;
pub use remove::concurrent_remove;
pub use request::{normalize_path, Content, FsRequest, Response};
pub use session::Session;
pub use spec_file::{FutureFile, SpecFile, DEFAULT_FILE_MODE};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccelError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory is not empty: {0}")]
    NotEmpty(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type AccelResult<T> = Result<T, AccelError>;

impl From<std::io::Error> for AccelError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return AccelError::NotFound(err.to_string());
        }
        AccelError::IoError(err.to_string())
    }
}

/// Invariant violations (a relative path inside the engine, empty path
/// segments) are programmer errors. Engine code runs on per-connection
/// tasks, where a panic would only unwind that one task and leave the
/// daemon serving with a corrupt view, so the whole process goes down
/// instead.
pub(crate) fn fatal(msg: String) -> ! {
    log::error!("fatal: {}", msg);
    std::process::abort();
}
