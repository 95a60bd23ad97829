//! Package name derivation.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{UpkgError, UpkgResult};

/// Longest suffixes first so `.tar.gz` wins over `.gz`.
const PACKAGE_EXTENSIONS: &[&str] = &[
    ".pkg.tar.zst",
    ".tar.gz",
    ".tar.xz",
    ".tar.bz2",
    ".tar.zst",
    ".appimage",
    ".tgz",
    ".txz",
    ".tbz2",
    ".tzst",
    ".tar",
    ".zip",
    ".deb",
    ".rpm",
    ".bin",
    ".run",
    ".gz",
    ".xz",
    ".bz2",
    ".zst",
];

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)[-_]v?\d").expect("unable to compile version regex"));

static ARCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)[-_.](x86[-_]64|amd64|aarch64|arm64|armhf|armv7l|i[3-6]86|noarch|x64|linux(64)?)$",
    )
    .expect("unable to compile arch regex")
});

fn strip_extension(file_name: &str) -> &str {
    let lower = file_name.to_ascii_lowercase();
    PACKAGE_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext) && lower.len() > ext.len())
        .map_or(file_name, |ext| &file_name[..file_name.len() - ext.len()])
}

fn strip_arch(name: &mut String) {
    while let Some(m) = ARCH_RE.find(name) {
        if m.start() == 0 {
            break;
        }
        name.truncate(m.start());
    }
}

/// Derives a display name from a package file name by dropping the extension,
/// the version and architecture tags.
///
/// `GitButler_Nightly-0.5.1650-1.x86_64.rpm` becomes `GitButler_Nightly`.
pub fn name_from_filename(file_name: &str) -> String {
    let stem = strip_extension(file_name);

    let mut name = stem.to_string();
    strip_arch(&mut name);
    if let Some(m) = VERSION_RE.captures(&name).and_then(|c| c.get(1)) {
        name = m.as_str().to_string();
    }
    strip_arch(&mut name);

    let name = name.trim_matches(|c: char| matches!(c, '-' | '_' | '.' | ' '));
    if name.is_empty() {
        stem.to_string()
    } else {
        name.to_string()
    }
}

/// Lowercases `raw` and maps it onto `[a-z0-9._-]`, collapsing runs of
/// replaced characters into one `-`.
pub fn normalize_name(raw: &str) -> UpkgResult<String> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }

    let normalized = out.trim_matches(|c| c == '-' || c == '.');
    if normalized.is_empty() {
        return Err(UpkgError::InvalidInput(format!(
            "'{raw}' does not contain any usable name characters"
        )));
    }
    Ok(normalized.to_string())
}

/// `<normalized name>-<unix seconds>`.
pub fn install_id(normalized: &str, at: DateTime<Utc>) -> String {
    format!("{normalized}-{}", at.timestamp())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_name_from_filename() {
        let cases = [
            ("GitButler_Nightly-0.5.1650-1.x86_64.rpm", "GitButler_Nightly"),
            ("code_1.85.1-1702462158_amd64.deb", "code"),
            ("Obsidian-1.5.3.AppImage", "Obsidian"),
            ("discord-0.0.40.tar.gz", "discord"),
            ("firefox-esr.tar.bz2", "firefox-esr"),
            ("nvim-linux64.tar.gz", "nvim"),
            ("7zip", "7zip"),
            ("myapp-v2.0.zip", "myapp"),
            ("tool_x86_64", "tool"),
            ("app-linux-x64-1.0.tar.xz", "app"),
            (".deb", "deb"),
        ];
        for (input, expected) in cases {
            assert_eq!(name_from_filename(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("GitButler_Nightly").unwrap(), "gitbutler_nightly");
        assert_eq!(normalize_name("My Cool App!").unwrap(), "my-cool-app");
        assert_eq!(normalize_name("  ..weird//name..").unwrap(), "weird-name");
        assert!(normalize_name("!!!").is_err());
        assert!(normalize_name("").is_err());
    }

    #[test]
    fn test_install_id() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(install_id("myapp", at), "myapp-1704067200");
    }
}
