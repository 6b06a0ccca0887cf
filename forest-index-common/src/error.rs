//! Crate-wide error types.
//!
//! Each failure domain gets its own [thiserror]-derived enum; [CoreError]
//! composes them so that callers further up the stack (the builder, the
//! query engine, the CLI) can propagate a single error type with `?`.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Wrapper around [std::io::Error] that allows it to be cloned by putting it
/// behind an [Arc]. [Page] read failures need to be clonable so that a single
/// failed read can be reported to more than one pending query.
#[derive(Debug, Clone)]
pub struct IoError(pub Arc<std::io::Error>);

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<std::io::Error> for IoError {
    fn from(value: std::io::Error) -> Self {
        Self(Arc::new(value))
    }
}

/// The point-record file or index sidecar did not have the expected shape.
#[derive(Error, Debug, Clone)]
#[error("invalid format in {path:?}: {message}")]
pub struct FormatError {
    pub path: PathBuf,
    pub message: String,
}

/// A value (an ordinal, an offset, a level) lay outside of its valid range.
#[derive(Error, Debug, Clone)]
#[error("{what} out of range: got {got}, expected {valid_min}..={valid_max}")]
pub struct RangeError {
    pub what: &'static str,
    pub got: i64,
    pub valid_min: i64,
    pub valid_max: i64,
}

/// The builder was asked to advance, resume, or report progress in a way
/// that violates the state machine's ordering.
#[derive(Error, Debug, Clone)]
#[error("invalid builder state transition: {message}")]
pub struct BuilderStateError {
    pub message: String,
}

/// The page cache was asked to do something that violates its invariants
/// (e.g. evict a pinned page, or touch a key that was never inserted).
#[derive(Error, Debug, Clone)]
#[error("page cache invariant violated: {message}")]
pub struct CacheInvariantError {
    pub message: String,
}

/// A page's pipeline state was driven out of its allowed progression.
#[derive(Error, Debug, Clone)]
#[error("invalid page pipeline transition: {message}")]
pub struct PipelineStateError {
    pub message: String,
}

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("I/O error accessing {path:?}: {source}")]
    Io { path: PathBuf, source: IoError },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    BuilderState(#[from] BuilderStateError),

    #[error(transparent)]
    CacheInvariant(#[from] CacheInvariantError),

    #[error(transparent)]
    PipelineState(#[from] PipelineStateError),

    #[error(transparent)]
    Las(#[from] las::Error),
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source: source.into(),
        }
    }
}
