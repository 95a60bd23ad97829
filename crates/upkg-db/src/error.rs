//! Error types for upkg-db.

use miette::Diagnostic;
use thiserror::Error;

/// Database error type for upkg-db operations.
#[derive(Error, Diagnostic, Debug)]
pub enum DbError {
    #[error("Database connection failed: {0}")]
    #[diagnostic(
        code(upkg_db::connection),
        help("Check if the database file exists and is accessible")
    )]
    ConnectionError(String),

    #[error("Database query failed: {0}")]
    #[diagnostic(code(upkg_db::query))]
    QueryError(String),

    #[error("Database migration failed: {0}")]
    #[diagnostic(
        code(upkg_db::migration),
        help("The database schema may be corrupted. Move the database file aside and retry.")
    )]
    MigrationError(String),

    #[error("Install record not found: {0}")]
    #[diagnostic(
        code(upkg_db::not_found),
        help("Run 'upkg list' to see installed packages")
    )]
    NotFound(String),

    #[error("Install record already exists: {0}")]
    #[diagnostic(code(upkg_db::duplicate))]
    Duplicate(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(upkg_db::io), help("Check file permissions and disk space"))]
    IoError(#[from] std::io::Error),
}

impl From<diesel::result::Error> for DbError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::NotFound => DbError::NotFound("Record not found".to_string()),
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DbError::Duplicate(info.message().to_string())
            }
            Error::DatabaseError(_, info) => DbError::QueryError(info.message().to_string()),
            other => DbError::QueryError(other.to_string()),
        }
    }
}

impl From<diesel::result::ConnectionError> for DbError {
    fn from(err: diesel::result::ConnectionError) -> Self {
        DbError::ConnectionError(err.to_string())
    }
}

/// Result type alias for upkg-db operations.
pub type Result<T> = std::result::Result<T, DbError>;
