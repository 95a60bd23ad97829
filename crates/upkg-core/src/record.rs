//! Install records and their stored metadata document.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use upkg_db::models::Install;

use crate::error::{UpkgError, UpkgResult};

/// Version written into every metadata document.
pub const METADATA_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Deb,
    Rpm,
    AppImage,
    Tarball,
    Zip,
    Binary,
}

impl PackageType {
    pub const ALL: [PackageType; 6] = [
        PackageType::Deb,
        PackageType::Rpm,
        PackageType::AppImage,
        PackageType::Tarball,
        PackageType::Zip,
        PackageType::Binary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PackageType::Deb => "deb",
            PackageType::Rpm => "rpm",
            PackageType::AppImage => "appimage",
            PackageType::Tarball => "tarball",
            PackageType::Zip => "zip",
            PackageType::Binary => "binary",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageType {
    type Err = UpkgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UpkgError::InvalidInput(format!("unknown package type '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaylandSupport {
    #[default]
    Unknown,
    Native,
    XWayland,
    Hybrid,
}

impl fmt::Display for WaylandSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaylandSupport::Unknown => "unknown",
            WaylandSupport::Native => "native",
            WaylandSupport::XWayland => "xwayland",
            WaylandSupport::Hybrid => "hybrid",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMethod {
    /// Extracted into the upkg install directory.
    #[default]
    Local,
    /// Handed to pacman after conversion.
    PacmanManaged,
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstallMethod::Local => "local",
            InstallMethod::PacmanManaged => "pacman-managed",
        })
    }
}

/// Fields harvested from a `.desktop` file shipped inside the package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedMeta {
    pub categories: Vec<String>,
    pub comment: Option<String>,
    pub startup_wm_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    /// Installed icon paths in install order, without duplicates.
    pub icon_files: Vec<PathBuf>,
    pub wrapper_script: Option<PathBuf>,
    pub wayland_support: WaylandSupport,
    pub install_method: InstallMethod,
    pub desktop_files: Vec<PathBuf>,
    pub extracted_meta: Option<ExtractedMeta>,
    pub system_package: Option<String>,
}

impl Metadata {
    pub fn add_icon(&mut self, path: PathBuf) {
        if !self.icon_files.contains(&path) {
            self.icon_files.push(path);
        }
    }

    /// Serializes as `{"version": 1, ...}`.
    pub fn to_json(&self) -> UpkgResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("version".into(), Value::from(METADATA_VERSION));
        }
        Ok(value.to_string())
    }

    /// Decodes a stored document.
    ///
    /// Documents without a `version` key predate versioning and are read as
    /// version 1. Versions newer than [`METADATA_VERSION`] are rejected.
    pub fn from_json(raw: &str) -> UpkgResult<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        let Value::Object(map) = &mut value else {
            return Err(UpkgError::PersistenceFailure(
                "metadata is not a JSON object".into(),
            ));
        };

        match map.remove("version") {
            None => {}
            Some(Value::Number(n)) if n.as_u64() == Some(METADATA_VERSION) => {}
            Some(Value::Number(n)) if n.as_u64().is_some_and(|v| v > METADATA_VERSION) => {
                return Err(UpkgError::PersistenceFailure(format!(
                    "metadata version {n} is newer than supported version {METADATA_VERSION}"
                )));
            }
            Some(other) => {
                return Err(UpkgError::PersistenceFailure(format!(
                    "invalid metadata version {other}"
                )));
            }
        }

        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Replace an existing install of the same name.
    pub force: bool,
    pub skip_desktop: bool,
    pub custom_name: Option<String>,
    pub skip_wayland_env: bool,
    /// Passed through as `pacman --overwrite '*'`.
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub install_id: String,
    pub package_type: PackageType,
    pub name: String,
    pub version: String,
    pub install_date: DateTime<Utc>,
    pub original_file: PathBuf,
    pub install_path: PathBuf,
    pub desktop_file: Option<PathBuf>,
    pub metadata: Metadata,
}

impl InstallRecord {
    /// Every file and directory the record owns on disk.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if !self.install_path.as_os_str().is_empty() {
            paths.push(self.install_path.clone());
        }
        paths.extend(self.metadata.wrapper_script.iter().cloned());
        paths.extend(self.desktop_file.iter().cloned());
        for desktop in &self.metadata.desktop_files {
            if !paths.contains(desktop) {
                paths.push(desktop.clone());
            }
        }
        paths.extend(self.metadata.icon_files.iter().cloned());
        paths
    }
}

impl TryFrom<Install> for InstallRecord {
    type Error = UpkgError;

    fn try_from(row: Install) -> Result<Self, Self::Error> {
        let install_date = DateTime::parse_from_rfc3339(&row.install_date)
            .map_err(|e| {
                UpkgError::PersistenceFailure(format!(
                    "invalid install date '{}': {e}",
                    row.install_date
                ))
            })?
            .with_timezone(&Utc);

        Ok(Self {
            package_type: row.package_type.parse()?,
            install_date,
            original_file: PathBuf::from(row.original_file),
            install_path: PathBuf::from(row.install_path),
            desktop_file: (!row.desktop_file.is_empty()).then(|| PathBuf::from(row.desktop_file)),
            metadata: Metadata::from_json(&row.metadata)?,
            install_id: row.install_id,
            name: row.name,
            version: row.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_is_versioned() {
        let mut metadata = Metadata {
            wrapper_script: Some(PathBuf::from("/home/u/.local/bin/myapp")),
            wayland_support: WaylandSupport::Hybrid,
            install_method: InstallMethod::PacmanManaged,
            system_package: Some("myapp".into()),
            ..Default::default()
        };
        metadata.add_icon(PathBuf::from("/i/48x48/apps/myapp.png"));
        metadata.add_icon(PathBuf::from("/i/48x48/apps/myapp.png"));

        let json = metadata.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["install_method"], "pacman-managed");
        assert_eq!(value["wayland_support"], "hybrid");
        assert_eq!(value["icon_files"].as_array().unwrap().len(), 1);

        assert_eq!(Metadata::from_json(&json).unwrap(), metadata);
    }

    #[test]
    fn test_legacy_document_reads_as_version_one() {
        let legacy = r#"{"icon_files":["/i/a.png"],"wayland_support":"native"}"#;
        let metadata = Metadata::from_json(legacy).unwrap();
        assert_eq!(metadata.icon_files, vec![PathBuf::from("/i/a.png")]);
        assert_eq!(metadata.wayland_support, WaylandSupport::Native);
        assert_eq!(metadata.install_method, InstallMethod::Local);

        assert_eq!(Metadata::from_json("{}").unwrap(), Metadata::default());
    }

    #[test]
    fn test_future_version_rejected() {
        let err = Metadata::from_json(r#"{"version":2}"#).unwrap_err();
        assert!(matches!(err, UpkgError::PersistenceFailure(_)));
        assert!(Metadata::from_json(r#"{"version":"one"}"#).is_err());
        assert!(Metadata::from_json("[]").is_err());
    }

    #[test]
    fn test_package_type_parsing() {
        assert_eq!("AppImage".parse::<PackageType>().unwrap(), PackageType::AppImage);
        assert_eq!("zip".parse::<PackageType>().unwrap(), PackageType::Zip);
        assert!("snap".parse::<PackageType>().is_err());
        assert_eq!(
            serde_json::to_string(&PackageType::AppImage).unwrap(),
            "\"appimage\""
        );
    }

    #[test]
    fn test_record_from_row() {
        let row = Install {
            id: 1,
            install_id: "myapp-1700000000".into(),
            package_type: "tarball".into(),
            name: "MyApp".into(),
            version: "1.0".into(),
            install_date: "2024-01-02T03:04:05+00:00".into(),
            original_file: "/tmp/myapp.tar.gz".into(),
            install_path: "/apps/myapp".into(),
            desktop_file: String::new(),
            metadata: "{}".into(),
        };
        let record = InstallRecord::try_from(row).unwrap();
        assert_eq!(record.package_type, PackageType::Tarball);
        assert!(record.desktop_file.is_none());
        assert_eq!(record.artifacts(), vec![PathBuf::from("/apps/myapp")]);
    }
}
