//! Database connection management.

use std::path::Path;

use diesel::{sql_query, Connection, ConnectionError, RunQueryDsl, SqliteConnection};
use tracing::trace;

use crate::migration::apply_migrations;

const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database connection wrapper with migration support.
pub struct DbConnection {
    conn: SqliteConnection,
}

impl DbConnection {
    /// Opens a writable connection, enabling WAL and applying pending migrations.
    ///
    /// The parent directory of `path` is created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or migrations fail.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConnectionError::BadConnection(e.to_string()))?;
        }

        let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;
        trace!(path = %path.display(), "opened write connection");

        Self::apply_pragmas(&mut conn)?;
        sql_query("PRAGMA journal_mode = WAL;")
            .execute(&mut conn)
            .map_err(|e| ConnectionError::BadConnection(e.to_string()))?;

        apply_migrations(&mut conn).map_err(|e| ConnectionError::BadConnection(e.to_string()))?;

        Ok(Self { conn })
    }

    /// Opens a connection that rejects writes (`PRAGMA query_only`).
    ///
    /// The database must already have been created by [`DbConnection::open`].
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;
        trace!(path = %path.display(), "opened read connection");

        Self::apply_pragmas(&mut conn)?;
        sql_query("PRAGMA query_only = ON;")
            .execute(&mut conn)
            .map_err(|e| ConnectionError::BadConnection(e.to_string()))?;

        Ok(Self { conn })
    }

    fn apply_pragmas(conn: &mut SqliteConnection) -> Result<(), ConnectionError> {
        sql_query(format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))
            .execute(conn)
            .map_err(|e| ConnectionError::BadConnection(e.to_string()))?;
        Ok(())
    }

    /// Gets a mutable reference to the underlying connection.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl std::ops::Deref for DbConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for DbConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
