//! Error types for upkg-core.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;
use upkg_config::error::ConfigError;
use upkg_db::error::DbError;
use upkg_package::PackageError;
use upkg_utils::error::{FileSystemError, LockError, PathError};

/// Core error type for install and uninstall operations.
#[derive(Error, Diagnostic, Debug)]
pub enum UpkgError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),

    #[error("Error while {action}")]
    #[diagnostic(code(upkg::io), help("Check file permissions and disk space"))]
    IoError {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(upkg::archive), help("The archive may be truncated or corrupted"))]
    Archive(#[from] compak::error::ArchiveError),

    #[error(transparent)]
    #[diagnostic(code(upkg::json))]
    Json(#[from] serde_json::Error),

    #[error("{0} not found")]
    #[diagnostic(
        code(upkg::not_found),
        help("Check the path or run 'upkg list' to see installed packages")
    )]
    NotFound(String),

    #[error("Invalid input: {0}")]
    #[diagnostic(code(upkg::invalid_input))]
    InvalidInput(String),

    #[error("No executable found in {}", .0.display())]
    #[diagnostic(
        code(upkg::no_executable),
        help(
            "The package does not ship an ELF executable. Use --name if the wrong package was picked."
        )
    )]
    NoExecutableFound(PathBuf),

    #[error("No installation method available for {package}")]
    #[diagnostic(code(upkg::no_installation_method), help("Install one of: {tools}"))]
    NoInstallationMethod { package: String, tools: String },

    #[error("`{command}` failed: {reason}")]
    #[diagnostic(code(upkg::external_tool))]
    ExternalToolFailure { command: String, reason: String },

    #[error("'{0}' is already installed")]
    #[diagnostic(
        code(upkg::already_installed),
        help("Pass --force to replace the existing installation")
    )]
    AlreadyInstalled(String),

    #[error("Failed to persist install record: {0}")]
    #[diagnostic(
        code(upkg::persistence),
        help("Check that the database directory is writable")
    )]
    PersistenceFailure(String),

    #[error("No backend can install {} (detected: {detected})", path.display())]
    #[diagnostic(code(upkg::unsupported_format))]
    UnsupportedFormat {
        path: PathBuf,
        detected: String,
        #[help]
        hint: Option<String>,
    },

    #[error("Rollback left {} step(s) undone: {}", .0.len(), .0.join("; "))]
    #[diagnostic(
        code(upkg::rollback),
        help("Remove the listed paths by hand before retrying")
    )]
    Rollback(Vec<String>),
}

/// A specialized Result type for upkg-core.
pub type UpkgResult<T> = std::result::Result<T, UpkgError>;

impl From<diesel::result::Error> for UpkgError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Database(err.into())
    }
}

impl From<upkg_utils::error::UtilsError> for UpkgError {
    fn from(err: upkg_utils::error::UtilsError) -> Self {
        use upkg_utils::error::UtilsError;

        match err {
            UtilsError::Path(err) => Self::Path(err),
            UtilsError::FileSystem(err) => Self::FileSystem(err),
            UtilsError::Lock(err) => Self::Lock(err),
        }
    }
}

pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> UpkgResult<T>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> UpkgResult<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            UpkgError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
