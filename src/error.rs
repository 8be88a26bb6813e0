//! Error types for stacker.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The variants follow the failure classes a build can hit: recipe
//! syntax, dependency resolution, filesystem capabilities, network fetches,
//! layer assembly, apply conflicts, and in-container run failures.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stacker operations.
pub type Result<T> = std::result::Result<T, StackerError>;

/// Main error type for stacker.
#[derive(Error, Debug)]
pub enum StackerError {
    // Recipe errors
    #[error("recipe {path}: {reason}")]
    RecipeSyntax { path: String, reason: String },

    #[error("no value for substitution {variable}")]
    SubstitutionUnresolved { variable: String },

    #[error("couldn't resolve dependencies: {residual:?}")]
    DependencyUnresolved { residual: Vec<String> },

    #[error("prerequisite cycle involving {path}")]
    PrerequisiteCycle { path: String },

    // Storage / filesystem errors
    #[error("filesystem capability missing: {reason}. {remedy}")]
    FilesystemCapability { reason: String, remedy: String },

    #[error("storage operation failed on {name}: {reason}")]
    Storage { name: String, reason: String },

    // Network errors
    #[error("couldn't fetch {url}: {reason}")]
    NetworkFetch { url: String, reason: String },

    // OCI assembly errors
    #[error("layer assembly failed: {reason}")]
    LayerAssembly { reason: String },

    #[error("tag not found in layout: {tag}")]
    TagNotFound { tag: String },

    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    // Apply errors
    #[error(transparent)]
    Apply(#[from] ApplyConflict),

    // Run errors
    #[error("run commands for {layer} failed with status {status}")]
    RunFailure { layer: String, status: i32 },

    // Generic errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Typed conflicts raised by the apply engine. The offending path inside the
/// rootfs is always reported.
#[derive(Error, Debug)]
pub enum ApplyConflict {
    #[error("apply can't merge files of different types: {path}")]
    IncompatibleType { path: String },

    #[error("{attr} mismatch on {path}: {ours} vs {theirs}")]
    AttrMismatch { path: String, attr: &'static str, ours: String, theirs: String },

    #[error("couldn't merge {path}: {reason}")]
    Unmergeable { path: String, reason: String },

    #[error("existing file different, can't diff {path} of type {content_type}")]
    BinaryConflict { path: String, content_type: String },
}

impl StackerError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
