use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Failures while expanding user supplied paths.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("Path is empty")]
    #[diagnostic(code(upkg_utils::path::empty))]
    Empty,

    #[error("Could not determine the working directory: {source}")]
    #[diagnostic(code(upkg_utils::path::cwd))]
    CurrentDir {
        #[source]
        source: std::io::Error,
    },

    #[error("`${{{var}}}` is referenced by `{input}` but not set")]
    #[diagnostic(
        code(upkg_utils::path::env),
        help("Export the variable or use an absolute path")
    )]
    MissingEnvVar { var: String, input: String },

    #[error("Missing `}}` in `{input}`")]
    #[diagnostic(code(upkg_utils::path::syntax))]
    UnclosedVariable { input: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum FileSystemError {
    #[error("Could not {action} `{}`: {source}", path.display())]
    #[diagnostic(
        code(upkg_utils::fs::file),
        help("Check file permissions and available disk space")
    )]
    File {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not {action} directory `{}`: {source}", path.display())]
    #[diagnostic(
        code(upkg_utils::fs::dir),
        help("Check file permissions and available disk space")
    )]
    Directory {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("`{}` exists and is not a directory", path.display())]
    #[diagnostic(code(upkg_utils::fs::not_dir))]
    NotADirectory { path: PathBuf },
}

#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error("Failed to prepare lock file: {0}")]
    #[diagnostic(code(upkg_utils::lock::io))]
    Io(#[from] std::io::Error),

    #[error("Failed to acquire lock on {0}")]
    #[diagnostic(
        code(upkg_utils::lock::acquire),
        help("Another upkg process may be operating on the same package")
    )]
    AcquireFailed(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum UtilsError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),
}

pub type FileSystemResult<T> = std::result::Result<T, FileSystemError>;
pub type LockResult<T> = std::result::Result<T, LockError>;
pub type PathResult<T> = std::result::Result<T, PathError>;
