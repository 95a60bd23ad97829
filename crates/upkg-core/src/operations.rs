//! Install and uninstall entry points tying backends, transactions and the
//! record store together.

use std::{path::Path, sync::Arc};

use tracing::{error, info, warn};
use upkg_config::config::Config;
use upkg_utils::{error::LockError, lock::FileLock};

use crate::{
    backend::{BackendContext, BackendKind},
    database::{DatabaseStore, DieselStore},
    error::{UpkgError, UpkgResult},
    naming::normalize_name,
    record::{InstallOptions, InstallRecord, PackageType},
    registry::Registry,
    runner::SystemCommandRunner,
    transaction::Transaction,
};

pub struct PackageManager {
    ctx: Arc<BackendContext>,
    registry: Registry,
    store: Arc<dyn DatabaseStore>,
}

impl PackageManager {
    pub fn new(ctx: Arc<BackendContext>, store: Arc<dyn DatabaseStore>) -> Self {
        Self {
            registry: Registry::new(ctx.clone()),
            ctx,
            store,
        }
    }

    /// Real command runner, paths and database from `config`.
    pub fn from_config(config: &Config) -> UpkgResult<Self> {
        let ctx = BackendContext::from_config(config, Arc::new(SystemCommandRunner))?;
        let store = DieselStore::open(config.get_db_path()?)?;
        Ok(Self::new(Arc::new(ctx), Arc::new(store)))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &dyn DatabaseStore {
        self.store.as_ref()
    }

    /// Detects the format of `path`, installs it and stores the record.
    ///
    /// Any failure, including failing to store the record, rolls back every
    /// file and command the install produced.
    pub async fn install(&self, path: &Path, opts: &InstallOptions) -> UpkgResult<InstallRecord> {
        let backend = self.registry.detect_backend(path).await?;
        info!(backend = backend.name(), path = %path.display(), "installing");

        let mut tx = self.ctx.transaction();
        let record = match backend.install(path, opts, &mut tx).await {
            Ok(record) => record,
            Err(err) => return Err(abort(tx, err).await),
        };

        if let Err(err) = self.persist(&record, opts) {
            let err = match err {
                err @ (UpkgError::AlreadyInstalled(_) | UpkgError::PersistenceFailure(_)) => err,
                other => UpkgError::PersistenceFailure(other.to_string()),
            };
            return Err(abort(tx, err).await);
        }

        tx.commit();
        info!(pkg_name = %record.name, install_id = %record.install_id, "install complete");
        Ok(record)
    }

    fn persist(&self, record: &InstallRecord, opts: &InstallOptions) -> UpkgResult<()> {
        match self.store.find_by_name(&record.name)? {
            Some(existing) if opts.force => self.store.replace(&existing.install_id, record),
            Some(_) => Err(UpkgError::AlreadyInstalled(record.name.clone())),
            None => self.store.create(record),
        }
    }

    /// Looks a record up by install id, then by name.
    pub fn find(&self, name_or_id: &str) -> UpkgResult<InstallRecord> {
        if let Some(record) = self.store.get(name_or_id)? {
            return Ok(record);
        }
        self.store
            .find_by_name(name_or_id)?
            .ok_or_else(|| UpkgError::NotFound(format!("Package '{name_or_id}'")))
    }

    pub fn list(&self, package_type: Option<PackageType>) -> UpkgResult<Vec<InstallRecord>> {
        self.store.list(package_type)
    }

    /// Removes an installed package and its record.
    pub async fn uninstall(&self, name_or_id: &str) -> UpkgResult<InstallRecord> {
        let record = self.find(name_or_id)?;
        let _lock = lock_name(&record.name).await?;

        let backend = self
            .registry
            .get_backend(BackendKind::from(record.package_type).name())?;
        backend.uninstall(&record).await?;

        self.store.delete(&record.install_id)?;
        info!(pkg_name = %record.name, install_id = %record.install_id, "uninstalled");
        Ok(record)
    }

    /// Uninstalls every recorded package, continuing past failures.
    pub async fn uninstall_all(&self) -> UpkgResult<Vec<(InstallRecord, UpkgResult<()>)>> {
        let mut results = Vec::new();
        for record in self.store.list(None)? {
            let result = self.uninstall(&record.install_id).await.map(|_| ());
            if let Err(err) = &result {
                warn!(pkg_name = %record.name, error = %err, "uninstall failed");
            }
            results.push((record, result));
        }
        Ok(results)
    }
}

async fn lock_name(name: &str) -> UpkgResult<FileLock> {
    let name = normalize_name(name)?;
    let lock = tokio::task::spawn_blocking(move || FileLock::acquire(&name))
        .await
        .map_err(|e| LockError::AcquireFailed(e.to_string()))??;
    Ok(lock)
}

/// Rolls `tx` back and hands back the error that caused it.
async fn abort(mut tx: Transaction, err: UpkgError) -> UpkgError {
    warn!(error = %err, "install failed, rolling back");
    if let Err(rollback_err) = tx.rollback().await {
        error!(error = %rollback_err, "rollback incomplete");
    }
    err
}
