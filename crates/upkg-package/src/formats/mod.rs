//! Package format detection by magic bytes.
//!
//! Detection only ever looks at the leading bytes of a file (plus the ELF
//! section table for AppImage payloads); file extensions are a secondary hint
//! used by callers.

pub mod appimage;

use std::{fmt, path::Path};

use upkg_utils::fs::{read_file_signature, ELF_MAGIC_BYTES};

use crate::error::Result;

pub use appimage::{elf_payload_offset, is_appimage};

/// Number of leading bytes inspected when sniffing a file.
pub const SNIFF_LEN: usize = 512;

/// Magic bytes for AppImage type 2 (at offset 8).
pub const APPIMAGE_MAGIC_BYTES: [u8; 3] = [0x41, 0x49, 0x02];

/// Magic bytes for AppImage type 1 (at offset 8).
pub const APPIMAGE_V1_MAGIC_BYTES: [u8; 3] = [0x41, 0x49, 0x01];

/// Little-endian squashfs superblock magic (`hsqs`).
pub const SQUASHFS_MAGIC_BYTES: [u8; 4] = [0x68, 0x73, 0x71, 0x73];

pub const RPM_MAGIC_BYTES: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];
pub const AR_MAGIC_BYTES: &[u8; 8] = b"!<arch>\n";
pub const ZIP_MAGIC_BYTES: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
pub const GZIP_MAGIC_BYTES: [u8; 2] = [0x1f, 0x8b];
pub const BZIP2_MAGIC_BYTES: [u8; 3] = [0x42, 0x5a, 0x68];
pub const XZ_MAGIC_BYTES: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
pub const ZSTD_MAGIC_BYTES: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// `ustar` marker at offset 257 of a POSIX tar header.
pub const TAR_MAGIC_BYTES: &[u8; 5] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Formats recognized from file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    Deb,
    Rpm,
    AppImage,
    Elf,
    Zip,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Tar,
    /// Any other `ar` archive.
    Ar,
    ShellScript,
    Text,
    Unknown,
}

impl PackageFormat {
    /// True for formats the tarball backend knows how to unpack.
    pub fn is_archive(self) -> bool {
        matches!(
            self,
            Self::Zip | Self::Gzip | Self::Bzip2 | Self::Xz | Self::Zstd | Self::Tar
        )
    }

    /// Remediation shown when no backend accepted a file of this format.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            Self::ShellScript | Self::Text => {
                Some(
                    "upkg installs packages, not scripts or text files. If this is an installer \
                     script, run it directly; if it is a release archive, download the .tar.gz, \
                     .zip, .deb, .rpm or .AppImage asset instead.",
                )
            }
            Self::Ar => Some("The file is an ar archive but not a Debian package."),
            Self::Unknown => {
                Some("Supported formats: .deb, .rpm, .AppImage, ELF binaries, tar and zip archives.")
            }
            _ => None,
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deb => "Debian package",
            Self::Rpm => "RPM package",
            Self::AppImage => "AppImage",
            Self::Elf => "ELF executable",
            Self::Zip => "zip archive",
            Self::Gzip => "gzip compressed data",
            Self::Bzip2 => "bzip2 compressed data",
            Self::Xz => "xz compressed data",
            Self::Zstd => "zstd compressed data",
            Self::Tar => "tar archive",
            Self::Ar => "ar archive",
            Self::ShellScript => "shell script",
            Self::Text => "plain text",
            Self::Unknown => "unknown data",
        };
        f.write_str(name)
    }
}

/// Classifies a byte prefix.
///
/// AppImages are only recognized here by their type 1/2 marker at offset 8.
/// Use [`detect_file`] to also catch ELF files carrying a squashfs payload.
pub fn sniff(bytes: &[u8]) -> PackageFormat {
    if bytes.starts_with(&ELF_MAGIC_BYTES) {
        let marker = bytes.get(8..11);
        if marker == Some(&APPIMAGE_MAGIC_BYTES[..]) || marker == Some(&APPIMAGE_V1_MAGIC_BYTES[..])
        {
            return PackageFormat::AppImage;
        }
        return PackageFormat::Elf;
    }
    if bytes.starts_with(AR_MAGIC_BYTES) {
        if bytes[AR_MAGIC_BYTES.len()..].starts_with(b"debian-binary") {
            return PackageFormat::Deb;
        }
        return PackageFormat::Ar;
    }
    if bytes.starts_with(&RPM_MAGIC_BYTES) {
        return PackageFormat::Rpm;
    }
    if bytes.starts_with(&ZIP_MAGIC_BYTES) {
        return PackageFormat::Zip;
    }
    if bytes.starts_with(&GZIP_MAGIC_BYTES) {
        return PackageFormat::Gzip;
    }
    if bytes.starts_with(&BZIP2_MAGIC_BYTES) {
        return PackageFormat::Bzip2;
    }
    if bytes.starts_with(&XZ_MAGIC_BYTES) {
        return PackageFormat::Xz;
    }
    if bytes.starts_with(&ZSTD_MAGIC_BYTES) {
        return PackageFormat::Zstd;
    }
    if bytes
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC_BYTES.len())
        .is_some_and(|m| m == TAR_MAGIC_BYTES)
    {
        return PackageFormat::Tar;
    }
    if bytes.starts_with(b"#!") {
        return PackageFormat::ShellScript;
    }
    if is_text(bytes) {
        return PackageFormat::Text;
    }
    PackageFormat::Unknown
}

/// Sniffs a file, upgrading ELF files with an appended squashfs image to AppImage.
pub fn detect_file<P: AsRef<Path>>(path: P) -> Result<PackageFormat> {
    let path = path.as_ref();
    let signature = read_file_signature(path, SNIFF_LEN)?;
    let format = sniff(&signature);

    if format == PackageFormat::Elf && is_appimage(path)? {
        return Ok(PackageFormat::AppImage);
    }
    Ok(format)
}

fn is_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.contains(&0) {
        return false;
    }
    // A multi-byte sequence cut at the sniff boundary is still text.
    let valid = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) if e.error_len().is_none() => {
            match std::str::from_utf8(&bytes[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    valid
        .chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t' | '\x0c'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_with(marker: &[u8]) -> Vec<u8> {
        let mut bytes = ELF_MAGIC_BYTES.to_vec();
        bytes.extend_from_slice(&[2, 1, 1, 0]);
        bytes.extend_from_slice(marker);
        bytes.resize(64, 0);
        bytes
    }

    #[test]
    fn test_sniff_archives() {
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08, 0x00]), PackageFormat::Gzip);
        assert_eq!(sniff(b"BZh91AY&SY"), PackageFormat::Bzip2);
        assert_eq!(
            sniff(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00]),
            PackageFormat::Xz
        );
        assert_eq!(sniff(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]), PackageFormat::Zstd);
        assert_eq!(sniff(b"PK\x03\x04rest"), PackageFormat::Zip);

        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff(&tar), PackageFormat::Tar);
    }

    #[test]
    fn test_sniff_packages() {
        assert_eq!(
            sniff(b"!<arch>\ndebian-binary   1342943816  0     0     100644  4"),
            PackageFormat::Deb
        );
        assert_eq!(sniff(b"!<arch>\nlibfoo.o/"), PackageFormat::Ar);
        assert_eq!(
            sniff(&[0xed, 0xab, 0xee, 0xdb, 0x03, 0x00]),
            PackageFormat::Rpm
        );
    }

    #[test]
    fn test_sniff_elf_and_appimage_marker() {
        assert_eq!(sniff(&elf_with(&[0, 0, 0])), PackageFormat::Elf);
        assert_eq!(sniff(&elf_with(b"AI\x02")), PackageFormat::AppImage);
        assert_eq!(sniff(&elf_with(b"AI\x01")), PackageFormat::AppImage);
    }

    #[test]
    fn test_sniff_text_and_scripts() {
        assert_eq!(sniff(b"#!/bin/sh\necho hi\n"), PackageFormat::ShellScript);
        assert_eq!(sniff(b"hello world\n"), PackageFormat::Text);
        assert_eq!(sniff("caf\u{e9}\n".as_bytes()), PackageFormat::Text);
        assert_eq!(sniff(&[0x00, 0x01, 0x02, 0x03]), PackageFormat::Unknown);
        assert_eq!(sniff(&[]), PackageFormat::Unknown);
    }

    #[test]
    fn test_text_hint_mentions_scripts() {
        let hint = PackageFormat::Text.hint().unwrap();
        assert!(hint.contains("script"));
        assert!(hint.contains(".tar.gz"));
        assert!(PackageFormat::Gzip.hint().is_none());
    }
}
