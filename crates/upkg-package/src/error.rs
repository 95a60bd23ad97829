//! Error types for the package crate.

use miette::Diagnostic;
use thiserror::Error;
use upkg_utils::error::FileSystemError;

/// Errors that can occur during desktop integration and format inspection.
#[derive(Error, Diagnostic, Debug)]
pub enum PackageError {
    #[error("Error while {action}: {source}")]
    #[diagnostic(code(upkg_package::io))]
    IoError {
        action: String,
        source: std::io::Error,
    },

    #[error("Failed to read magic bytes")]
    #[diagnostic(code(upkg_package::magic_bytes))]
    MagicBytesError,

    #[error(transparent)]
    #[diagnostic(code(upkg_package::image))]
    ImageError(#[from] image::ImageError),

    #[error("Invalid desktop entry: {0}")]
    #[diagnostic(
        code(upkg_package::desktop_entry),
        help("A desktop entry needs a [Desktop Entry] group with Type, Name and Exec keys")
    )]
    InvalidDesktopEntry(String),

    #[error("Malformed desktop file at line {line}: {reason}")]
    #[diagnostic(code(upkg_package::desktop_parse))]
    DesktopParse { line: usize, reason: String },

    #[error("Invalid asar archive: {0}")]
    #[diagnostic(code(upkg_package::asar))]
    Asar(String),

    #[error("Unsupported icon: {0}")]
    #[diagnostic(
        code(upkg_package::icon),
        help("Icons must be PNG, SVG or XPM files")
    )]
    UnsupportedIcon(String),

    #[error(transparent)]
    #[diagnostic(code(upkg_package::json))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    FileSystem(#[from] FileSystemError),
}

/// A specialized Result type for package operations.
pub type Result<T> = std::result::Result<T, PackageError>;

/// Extension trait for adding context to I/O errors.
pub trait ErrorContext<T> {
    /// Adds context to an error, describing what action was being performed.
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            PackageError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
