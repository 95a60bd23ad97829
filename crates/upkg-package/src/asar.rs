//! Read-only access to Electron `asar` archives.
//!
//! Layout: two Chromium pickles followed by the file data. The first pickle
//! holds the byte size of the second, the second holds a JSON directory tree.
//! File offsets in the tree are relative to the end of the header pickle.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use serde_json::Value;
use tracing::trace;

use crate::error::{ErrorContext, PackageError, Result};

/// Upper bound on the JSON header we are willing to load.
const MAX_HEADER_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsarEntry {
    /// Slash separated path inside the archive.
    pub path: String,
    pub offset: u64,
    pub size: u64,
    /// Stored next to the archive in `<name>.asar.unpacked/`.
    pub unpacked: bool,
}

pub struct AsarArchive {
    path: PathBuf,
    data_start: u64,
    entries: Vec<AsarEntry>,
}

impl AsarArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

        let mut prefix = [0u8; 16];
        file.read_exact(&mut prefix)
            .map_err(|_| PackageError::Asar("file too short".into()))?;

        let word =
            |i: usize| u32::from_le_bytes([prefix[i], prefix[i + 1], prefix[i + 2], prefix[i + 3]]);
        if word(0) != 4 {
            return Err(PackageError::Asar("bad size pickle".into()));
        }
        let header_size = word(4);
        let json_len = word(12);
        if json_len > MAX_HEADER_SIZE || json_len > header_size {
            return Err(PackageError::Asar(format!(
                "header length {json_len} out of range"
            )));
        }

        let mut json = vec![0u8; json_len as usize];
        file.read_exact(&mut json)
            .map_err(|_| PackageError::Asar("truncated header".into()))?;
        let header: Value = serde_json::from_slice(&json)?;

        let mut entries = Vec::new();
        collect_entries(&header, "", &mut entries)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        trace!(path = %path.display(), files = entries.len(), "opened asar archive");
        Ok(Self {
            path: path.to_path_buf(),
            data_start: 8 + u64::from(header_size),
            entries,
        })
    }

    pub fn entries(&self) -> &[AsarEntry] {
        &self.entries
    }

    /// Entries that look like application icons (`.png`, `.svg`), largest first.
    pub fn icon_entries(&self) -> Vec<&AsarEntry> {
        let mut icons: Vec<_> = self
            .entries
            .iter()
            .filter(|e| {
                let lower = e.path.to_ascii_lowercase();
                (lower.ends_with(".png") || lower.ends_with(".svg"))
                    && !lower.contains("node_modules/")
            })
            .collect();
        icons.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        icons
    }

    pub fn read(&self, entry: &AsarEntry) -> Result<Vec<u8>> {
        if entry.unpacked {
            let mut unpacked = self.path.clone().into_os_string();
            unpacked.push(".unpacked");
            let file = PathBuf::from(unpacked).join(&entry.path);
            return std::fs::read(&file).with_context(|| format!("reading {}", file.display()));
        }

        let mut file =
            File::open(&self.path).with_context(|| format!("opening {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.data_start + entry.offset))
            .with_context(|| format!("seeking to {} in {}", entry.path, self.path.display()))?;
        let mut buf = vec![0u8; entry.size as usize];
        file.read_exact(&mut buf)
            .with_context(|| format!("reading {} from {}", entry.path, self.path.display()))?;
        Ok(buf)
    }

    /// Writes `entry` to `dest`.
    pub fn extract(&self, entry: &AsarEntry, dest: &Path) -> Result<()> {
        let data = self.read(entry)?;
        std::fs::write(dest, data).with_context(|| format!("writing {}", dest.display()))
    }
}

fn collect_entries(node: &Value, prefix: &str, out: &mut Vec<AsarEntry>) -> Result<()> {
    let Some(files) = node.get("files").and_then(Value::as_object) else {
        return Ok(());
    };

    for (name, child) in files {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };

        if child.get("files").is_some() {
            collect_entries(child, &path, out)?;
            continue;
        }
        if child.get("link").is_some() {
            continue;
        }

        let size = child
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| PackageError::Asar(format!("missing size for {path}")))?;
        let unpacked = child
            .get("unpacked")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        // Offsets are serialized as strings to survive JSON's 53-bit integers.
        let offset = match child.get("offset") {
            Some(Value::String(s)) => {
                s.parse()
                    .map_err(|_| PackageError::Asar(format!("bad offset for {path}")))?
            }
            Some(v) => v.as_u64().unwrap_or(0),
            None if unpacked => 0,
            None => return Err(PackageError::Asar(format!("missing offset for {path}"))),
        };

        out.push(AsarEntry {
            path,
            offset,
            size,
            unpacked,
        });
    }

    Ok(())
}
