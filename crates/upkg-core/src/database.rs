//! Install record persistence.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use diesel::{Connection, SqliteConnection};
use tracing::{debug, trace};
use upkg_db::{
    connection::DbConnection,
    error::DbError,
    models::{Install, InstallChanges, NewInstall},
    repository::InstallRepository,
};

use crate::{
    error::{UpkgError, UpkgResult},
    naming::normalize_name,
    record::{InstallRecord, PackageType},
};

/// Read connections opened next to the single writer.
pub const DEFAULT_READERS: usize = 4;

/// Storage for install records.
pub trait DatabaseStore: Send + Sync {
    fn create(&self, record: &InstallRecord) -> UpkgResult<()>;

    fn get(&self, install_id: &str) -> UpkgResult<Option<InstallRecord>>;

    /// Newest record whose name matches `name` exactly or after normalization.
    fn find_by_name(&self, name: &str) -> UpkgResult<Option<InstallRecord>>;

    fn list(&self, package_type: Option<PackageType>) -> UpkgResult<Vec<InstallRecord>>;

    /// Updates version, desktop file and metadata of an existing record.
    fn update(&self, record: &InstallRecord) -> UpkgResult<()>;

    /// Returns false if no such record existed.
    fn delete(&self, install_id: &str) -> UpkgResult<bool>;

    /// Deletes `old_install_id` and inserts `record` atomically.
    fn replace(&self, old_install_id: &str, record: &InstallRecord) -> UpkgResult<()>;
}

/// SQLite store with one write connection and a pool of `query_only` readers.
#[derive(Clone)]
pub struct DieselStore {
    writer: Arc<Mutex<DbConnection>>,
    readers: Arc<Vec<Mutex<DbConnection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl DieselStore {
    pub fn open<P: AsRef<Path>>(path: P) -> UpkgResult<Self> {
        Self::open_with_readers(path, DEFAULT_READERS)
    }

    pub fn open_with_readers<P: AsRef<Path>>(path: P, readers: usize) -> UpkgResult<Self> {
        let path = path.as_ref();
        let writer = DbConnection::open(path).map_err(DbError::from)?;
        let readers = (0..readers.max(1))
            .map(|_| {
                DbConnection::open_read_only(path)
                    .map(Mutex::new)
                    .map_err(DbError::from)
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(path = %path.display(), readers = readers.len(), "opened install database");

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_writer<F, T>(&self, f: F) -> UpkgResult<T>
    where
        F: FnOnce(&mut SqliteConnection) -> UpkgResult<T>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| UpkgError::PersistenceFailure("database writer lock poisoned".into()))?;
        f(conn.conn())
    }

    fn with_reader<F, T>(&self, f: F) -> UpkgResult<T>
    where
        F: FnOnce(&mut SqliteConnection) -> UpkgResult<T>,
    {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        trace!(reader = idx, "using read connection");
        let mut conn = self.readers[idx]
            .lock()
            .map_err(|_| UpkgError::PersistenceFailure("database reader lock poisoned".into()))?;
        f(conn.conn())
    }
}

struct Row {
    package_type: &'static str,
    install_date: String,
    original_file: String,
    install_path: String,
    desktop_file: String,
    metadata: String,
}

impl Row {
    fn from_record(record: &InstallRecord) -> UpkgResult<Self> {
        Ok(Self {
            package_type: record.package_type.as_str(),
            install_date: record.install_date.to_rfc3339(),
            original_file: record.original_file.to_string_lossy().into_owned(),
            install_path: record.install_path.to_string_lossy().into_owned(),
            desktop_file: record
                .desktop_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            metadata: record.metadata.to_json()?,
        })
    }

    fn as_new<'a>(&'a self, record: &'a InstallRecord) -> NewInstall<'a> {
        NewInstall {
            install_id: &record.install_id,
            package_type: self.package_type,
            name: &record.name,
            version: &record.version,
            install_date: &self.install_date,
            original_file: &self.original_file,
            install_path: &self.install_path,
            desktop_file: &self.desktop_file,
            metadata: &self.metadata,
        }
    }
}

fn decode(rows: Vec<Install>) -> UpkgResult<Vec<InstallRecord>> {
    rows.into_iter().map(InstallRecord::try_from).collect()
}

impl DatabaseStore for DieselStore {
    fn create(&self, record: &InstallRecord) -> UpkgResult<()> {
        let row = Row::from_record(record)?;
        self.with_writer(|conn| {
            InstallRepository::insert(conn, &row.as_new(record))?;
            debug!(install_id = %record.install_id, "stored install record");
            Ok(())
        })
    }

    fn get(&self, install_id: &str) -> UpkgResult<Option<InstallRecord>> {
        self.with_reader(|conn| {
            InstallRepository::find_by_install_id(conn, install_id)?
                .map(InstallRecord::try_from)
                .transpose()
        })
    }

    fn find_by_name(&self, name: &str) -> UpkgResult<Option<InstallRecord>> {
        let wanted = normalize_name(name).ok();
        self.with_reader(|conn| {
            if let Some(row) = InstallRepository::find_by_name(conn, name)?.into_iter().next() {
                return InstallRecord::try_from(row).map(Some);
            }
            let Some(wanted) = wanted else {
                return Ok(None);
            };
            // Newest first.
            InstallRepository::list_all(conn)?
                .into_iter()
                .rev()
                .find(|row| normalize_name(&row.name).is_ok_and(|n| n == wanted))
                .map(InstallRecord::try_from)
                .transpose()
        })
    }

    fn list(&self, package_type: Option<PackageType>) -> UpkgResult<Vec<InstallRecord>> {
        self.with_reader(|conn| {
            let rows = match package_type {
                Some(t) => InstallRepository::list_by_type(conn, t.as_str())?,
                None => InstallRepository::list_all(conn)?,
            };
            decode(rows)
        })
    }

    fn update(&self, record: &InstallRecord) -> UpkgResult<()> {
        let row = Row::from_record(record)?;
        let changes = InstallChanges {
            version: Some(&record.version),
            desktop_file: Some(&row.desktop_file),
            metadata: Some(&row.metadata),
        };
        self.with_writer(|conn| {
            match InstallRepository::update(conn, &record.install_id, &changes)? {
                0 => Err(UpkgError::NotFound(format!("Install record {}", record.install_id))),
                _ => Ok(()),
            }
        })
    }

    fn delete(&self, install_id: &str) -> UpkgResult<bool> {
        self.with_writer(|conn| Ok(InstallRepository::delete_by_install_id(conn, install_id)? > 0))
    }

    fn replace(&self, old_install_id: &str, record: &InstallRecord) -> UpkgResult<()> {
        let row = Row::from_record(record)?;
        self.with_writer(|conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                InstallRepository::delete_by_install_id(conn, old_install_id)?;
                InstallRepository::insert(conn, &row.as_new(record))?;
                Ok(())
            })?;
            debug!(old = %old_install_id, new = %record.install_id, "replaced install record");
            Ok(())
        })
    }
}
