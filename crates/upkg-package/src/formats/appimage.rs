//! AppImage payload location.
//!
//! An AppImage is an ELF runtime with a squashfs image appended right after
//! the ELF section header table. The payload offset is what `unsquashfs -o`
//! needs to mount or extract the image.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use upkg_utils::fs::ELF_MAGIC_BYTES;

use super::SQUASHFS_MAGIC_BYTES;
use crate::error::{ErrorContext, PackageError, Result};

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

fn read_u16(bytes: &[u8], little: bool) -> u64 {
    let raw = [bytes[0], bytes[1]];
    u64::from(if little {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    })
}

fn read_u32(bytes: &[u8], little: bool) -> u64 {
    let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
    u64::from(if little {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    })
}

fn read_u64(bytes: &[u8], little: bool) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    if little {
        u64::from_le_bytes(raw)
    } else {
        u64::from_be_bytes(raw)
    }
}

/// Computes where the data following the ELF image starts:
/// `e_shoff + e_shentsize * e_shnum`.
///
/// Returns `None` if the reader does not hold a well-formed ELF header.
pub fn elf_payload_offset<R: Read + Seek>(reader: &mut R) -> Result<Option<u64>> {
    let mut header = [0u8; 64];
    reader
        .seek(SeekFrom::Start(0))
        .with_context(|| "seeking to ELF header".into())?;
    let read = reader
        .read(&mut header)
        .with_context(|| "reading ELF header".into())?;

    if read < 52 || header[..4] != ELF_MAGIC_BYTES {
        return Ok(None);
    }

    let little = header[5] == ELFDATA2LSB;
    let (shoff, shentsize, shnum) = match header[4] {
        ELFCLASS64 if read >= 64 => {
            (
                read_u64(&header[0x28..], little),
                read_u16(&header[0x3a..], little),
                read_u16(&header[0x3c..], little),
            )
        }
        ELFCLASS32 => {
            (
                read_u32(&header[0x20..], little),
                read_u16(&header[0x2e..], little),
                read_u16(&header[0x30..], little),
            )
        }
        _ => return Ok(None),
    };

    Ok(shoff.checked_add(shentsize * shnum))
}

/// Returns true if `path` is an ELF file with a squashfs image at its payload offset,
/// or carries the AppImage type marker.
pub fn is_appimage<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let mut ident = [0u8; 11];
    if file.read_exact(&mut ident).is_err() || ident[..4] != ELF_MAGIC_BYTES {
        return Ok(false);
    }
    if &ident[8..10] == b"AI" && matches!(ident[10], 1 | 2) {
        return Ok(true);
    }

    let Some(offset) = elf_payload_offset(&mut file)? else {
        return Ok(false);
    };

    let len = file
        .metadata()
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    if offset.saturating_add(4) > len {
        return Ok(false);
    }

    file.seek(SeekFrom::Start(offset))
        .map_err(|_| PackageError::MagicBytesError)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| PackageError::MagicBytesError)?;

    Ok(magic == SQUASHFS_MAGIC_BYTES)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Minimal 64-bit little-endian ELF with its section table ending at byte 192,
    /// followed by `payload`.
    fn fake_elf(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(&ELF_MAGIC_BYTES);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        bytes[6] = 1;
        // e_shoff = 64, e_shentsize = 64, e_shnum = 2 -> payload at 192
        bytes[0x28..0x30].copy_from_slice(&64u64.to_le_bytes());
        bytes[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
        bytes[0x3c..0x3e].copy_from_slice(&2u16.to_le_bytes());
        bytes.resize(192, 0);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_payload_offset_64bit() {
        let mut cursor = Cursor::new(fake_elf(&[]));
        assert_eq!(elf_payload_offset(&mut cursor).unwrap(), Some(192));
    }

    #[test]
    fn test_payload_offset_32bit_big_endian() {
        let mut bytes = vec![0u8; 52];
        bytes[..4].copy_from_slice(&ELF_MAGIC_BYTES);
        bytes[4] = ELFCLASS32;
        bytes[5] = 2;
        bytes[0x20..0x24].copy_from_slice(&1000u32.to_be_bytes());
        bytes[0x2e..0x30].copy_from_slice(&40u16.to_be_bytes());
        bytes[0x30..0x32].copy_from_slice(&3u16.to_be_bytes());

        let mut cursor = Cursor::new(bytes);
        assert_eq!(elf_payload_offset(&mut cursor).unwrap(), Some(1120));
    }

    #[test]
    fn test_payload_offset_rejects_non_elf() {
        let mut cursor = Cursor::new(b"not an elf at all, just some text padding....................".to_vec());
        assert_eq!(elf_payload_offset(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_is_appimage_detects_squashfs_payload() {
        let dir = tempfile::tempdir().unwrap();

        let appimage = dir.path().join("app");
        std::fs::write(&appimage, fake_elf(b"hsqs\0\0\0\0")).unwrap();
        assert!(is_appimage(&appimage).unwrap());

        let plain = dir.path().join("plain");
        std::fs::write(&plain, fake_elf(b"\0\0\0\0")).unwrap();
        assert!(!is_appimage(&plain).unwrap());

        let truncated = dir.path().join("truncated");
        std::fs::write(&truncated, fake_elf(&[])).unwrap();
        assert!(!is_appimage(&truncated).unwrap());
    }
}
