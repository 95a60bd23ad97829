//! Per-package exclusive locks.
//!
//! Installs and uninstalls of the same normalized package name are serialized
//! through an `flock` on `$XDG_RUNTIME_DIR/upkg/locks/<name>.lock`.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use nix::fcntl::{Flock, FlockArg};

use crate::{
    error::{LockError, LockResult},
    path::runtime_dir,
    string::sanitize_filename,
};

/// An exclusive `flock` held for as long as the value lives.
pub struct FileLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    fn lock_dir() -> LockResult<PathBuf> {
        let lock_dir = runtime_dir().join("upkg").join("locks");
        if !lock_dir.exists() {
            fs::create_dir_all(&lock_dir)?;
        }
        Ok(lock_dir)
    }

    fn lock_path(name: &str) -> LockResult<PathBuf> {
        Ok(Self::lock_dir()?.join(format!("{}.lock", sanitize_filename(name))))
    }

    fn open(path: &Path) -> LockResult<File> {
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    /// Acquires the lock for `name`, blocking until it is available.
    pub fn acquire(name: &str) -> LockResult<Self> {
        let path = Self::lock_path(name)?;
        let file = Self::open(&path)?;

        let file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, err)| LockError::AcquireFailed(format!("{}: {err}", path.display())))?;

        Ok(FileLock {
            _file: file,
            path,
        })
    }

    /// Tries to acquire the lock for `name` without blocking.
    ///
    /// Returns `None` if another holder currently owns it.
    pub fn try_acquire(name: &str) -> LockResult<Option<Self>> {
        let path = Self::lock_path(name)?;
        let file = Self::open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => {
                Ok(Some(FileLock {
                    _file: file,
                    path,
                }))
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, err)) => Err(LockError::AcquireFailed(format!("{}: {err}", path.display()))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn test_lock_path_is_sanitized() {
        let path = FileLock::lock_path("weird/pkg name").unwrap();
        assert!(path.to_string_lossy().ends_with("weird_pkg_name.lock"));
    }

    #[test]
    fn test_exclusive_lock() {
        let lock1 = FileLock::acquire("upkg-test-exclusive").unwrap();
        assert!(FileLock::try_acquire("upkg-test-exclusive")
            .unwrap()
            .is_none());

        drop(lock1);
        assert!(FileLock::try_acquire("upkg-test-exclusive")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_different_names_do_not_contend() {
        let a = FileLock::acquire("upkg-test-a").unwrap();
        let b = FileLock::try_acquire("upkg-test-b").unwrap();
        assert!(b.is_some());
        assert_ne!(a.path(), b.unwrap().path());
    }

    #[test]
    fn test_lock_blocks_until_released() {
        let lock1 = FileLock::acquire("upkg-test-block").unwrap();
        let path = lock1.path().to_path_buf();

        let handle = thread::spawn(move || {
            let lock2 = FileLock::acquire("upkg-test-block").unwrap();
            assert_eq!(lock2.path(), path);
        });

        thread::sleep(Duration::from_millis(100));
        drop(lock1);
        handle.join().unwrap();
    }
}
