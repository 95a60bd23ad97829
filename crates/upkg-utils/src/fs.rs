use std::{
    fs::{self, File},
    io::Read,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use crate::error::{FileSystemError, FileSystemResult};

/// Magic bytes at the start of every ELF object.
pub const ELF_MAGIC_BYTES: [u8; 4] = [0x7f, 0x45, 0x4c, 0x46];

pub trait FileSystemProvider: Send + Sync {
    /// Removes the specified file or directory safely.
    ///
    /// If the path does not exist, this function returns `Ok(())` without error. If the path
    /// points to a directory, it and all of its contents are removed recursively, equivalent to
    /// [`std::fs::remove_dir_all`]. Symlinks are removed without following them.
    ///
    /// # Errors
    ///
    /// Returns a [`FileSystemError::File`] if the removal fails for any reason other than
    /// the path not existing (e.g., permission denied, path is in use, etc.).
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::path::Path;
    ///
    /// use upkg_utils::error::FileSystemResult;
    /// use upkg_utils::fs::{FileSystemProvider, StandardFileSystemProvider};
    ///
    /// fn main() -> FileSystemResult<()> {
    ///     let fs = StandardFileSystemProvider;
    ///     fs.safe_remove(Path::new("/tmp/some_path"))?;
    ///     Ok(())
    /// }
    /// ```
    fn safe_remove(&self, path: &Path) -> FileSystemResult<()>;

    /// Creates a directory structure if it doesn't exist.
    ///
    /// If the directory already exists, this function does nothing. If the path exists but is
    /// not a directory, this function returns an error.
    ///
    /// # Errors
    ///
    /// * [`FileSystemError::Directory`] if the directory could not be created.
    /// * [`FileSystemError::NotADirectory`] if the path exists but is not a directory.
    fn ensure_dir_exists(&self, path: &Path) -> FileSystemResult<()>;

    /// Writes `contents` to `path`, replacing any existing file, and applies `mode`.
    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> FileSystemResult<()>;

    /// Moves `from` to `to`.
    fn rename(&self, from: &Path, to: &Path) -> FileSystemResult<()>;
}

#[derive(Default, Clone)]
pub struct StandardFileSystemProvider;

impl FileSystemProvider for StandardFileSystemProvider {
    fn safe_remove(&self, path: &Path) -> FileSystemResult<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(FileSystemError::File {
                    path: path.to_path_buf(),
                    action: "inspect",
                    source: err,
                })
            }
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(FileSystemError::File {
                    path: path.to_path_buf(),
                    action: "remove",
                    source: err,
                })
            }
        }
    }

    fn ensure_dir_exists(&self, path: &Path) -> FileSystemResult<()> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|err| {
                FileSystemError::Directory {
                    path: path.to_path_buf(),
                    action: "create",
                    source: err,
                }
            })?;
        } else if !path.is_dir() {
            return Err(FileSystemError::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> FileSystemResult<()> {
        fs::write(path, contents).map_err(|err| {
            FileSystemError::File {
                path: path.to_path_buf(),
                action: "write",
                source: err,
            }
        })?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| {
            FileSystemError::File {
                path: path.to_path_buf(),
                action: "set permissions on",
                source: err,
            }
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> FileSystemResult<()> {
        fs::rename(from, to).map_err(|err| {
            FileSystemError::File {
                path: from.to_path_buf(),
                action: "move",
                source: err,
            }
        })
    }
}

/// Creates a directory structure if it doesn't exist.
///
/// See [`FileSystemProvider::ensure_dir_exists`] for detailed documentation.
pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    StandardFileSystemProvider.ensure_dir_exists(path.as_ref())
}

/// Removes the specified file or directory safely.
///
/// See [`FileSystemProvider::safe_remove`] for detailed documentation.
pub fn safe_remove<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    StandardFileSystemProvider.safe_remove(path.as_ref())
}

/// Recursively visits every non-directory entry below `dir`, calling `action` on each.
///
/// Directory symlinks are not followed. A missing `dir` is treated as empty.
pub fn walk_dir<P, F, E>(dir: P, action: &mut F) -> Result<(), E>
where
    P: AsRef<Path>,
    F: FnMut(&Path) -> Result<(), E>,
    E: From<FileSystemError>,
{
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(());
    }

    let entries = fs::read_dir(dir).map_err(|err| {
        FileSystemError::Directory {
            path: dir.to_path_buf(),
            action: "read",
            source: err,
        }
    })?;

    // Sorted so callers see a stable traversal order across runs.
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            FileSystemError::Directory {
                path: dir.to_path_buf(),
                action: "read entry in",
                source: err,
            }
        })?;
        paths.push(entry.path());
    }
    paths.sort();

    for path in paths {
        let is_real_dir = fs::symlink_metadata(&path)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_real_dir {
            walk_dir(&path, action)?;
        } else {
            action(&path)?;
        }
    }

    Ok(())
}

/// Reads up to `bytes` leading bytes of a file.
pub fn read_file_signature<P: AsRef<Path>>(path: P, bytes: usize) -> FileSystemResult<Vec<u8>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| {
        FileSystemError::File {
            path: path.to_path_buf(),
            action: "open",
            source: err,
        }
    })?;

    let mut buf = Vec::with_capacity(bytes);
    file.take(bytes as u64)
        .read_to_end(&mut buf)
        .map_err(|err| {
            FileSystemError::File {
                path: path.to_path_buf(),
                action: "read",
                source: err,
            }
        })?;
    Ok(buf)
}

/// Returns true if the file starts with the ELF magic number.
pub fn is_elf<P: AsRef<Path>>(path: P) -> bool {
    read_file_signature(path, 4).is_ok_and(|sig| sig == ELF_MAGIC_BYTES)
}

/// Returns true for regular files with at least one execute bit set.
pub fn is_executable<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Marks a file as `0755`.
pub fn make_executable<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|err| {
        FileSystemError::File {
            path: path.to_path_buf(),
            action: "set permissions on",
            source: err,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_safe_remove_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_file.txt");
        fs::write(&file_path, "hello").unwrap();
        safe_remove(&file_path).unwrap();
        assert!(!file_path.exists());
    }

    #[test]
    fn test_safe_remove_dir() {
        let dir = tempdir().unwrap();
        let sub_dir = dir.path().join("sub");
        fs::create_dir(&sub_dir).unwrap();
        fs::write(sub_dir.join("inner"), "x").unwrap();
        safe_remove(&sub_dir).unwrap();
        assert!(!sub_dir.exists());
    }

    #[test]
    fn test_safe_remove_non_existent() {
        let dir = tempdir().unwrap();
        safe_remove(dir.path().join("non_existent.txt")).unwrap();
    }

    #[test]
    fn test_safe_remove_dangling_symlink() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(dir.path().join("missing"), &link).unwrap();
        safe_remove(&link).unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn test_ensure_dir_exists() {
        let dir = tempdir().unwrap();
        let new_dir = dir.path().join("a/b/c");
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.is_dir());
        ensure_dir_exists(&new_dir).unwrap();
    }

    #[test]
    fn test_ensure_dir_exists_file_collision() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("file.txt");
        fs::write(&file_path, "hello").unwrap();
        assert!(matches!(
            ensure_dir_exists(&file_path),
            Err(FileSystemError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_write_file_sets_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("script");
        StandardFileSystemProvider
            .write_file(&path, b"#!/bin/sh\n", 0o755)
            .unwrap();
        assert!(is_executable(&path));
    }

    #[test]
    fn test_walk_dir_visits_files_in_order() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/c")).unwrap();
        fs::write(dir.path().join("b/c/z"), "").unwrap();
        fs::write(dir.path().join("a"), "").unwrap();

        let mut seen = Vec::new();
        walk_dir(dir.path(), &mut |p: &Path| -> FileSystemResult<()> {
            seen.push(p.strip_prefix(dir.path()).unwrap().to_path_buf());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![Path::new("a").to_path_buf(), Path::new("b/c/z").to_path_buf()]
        );
    }

    #[test]
    fn test_is_elf_and_executable() {
        let dir = tempdir().unwrap();
        let elf = dir.path().join("bin");
        let mut contents = ELF_MAGIC_BYTES.to_vec();
        contents.extend_from_slice(&[0u8; 60]);
        fs::write(&elf, &contents).unwrap();
        assert!(is_elf(&elf));
        assert!(!is_executable(&elf));
        make_executable(&elf).unwrap();
        assert!(is_executable(&elf));

        let text = dir.path().join("text");
        fs::write(&text, "hello").unwrap();
        assert!(!is_elf(&text));
    }
}
