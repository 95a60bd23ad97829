//! Format-specific install strategies.

pub mod appimage;
pub mod binary;
pub mod deb;
pub mod pipeline;
pub mod rpm;
pub mod system;
pub mod tarball;

use std::{fmt, path::Path, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use upkg_config::{config::Config, env::EnvVar};
use upkg_package::{HicolorIconManager, IconManager};
use upkg_utils::fs::{FileSystemProvider, StandardFileSystemProvider};

use crate::{
    error::UpkgResult,
    record::{InstallOptions, InstallRecord, PackageType},
    runner::CommandRunner,
    transaction::Transaction,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Deb,
    Rpm,
    AppImage,
    Binary,
    Tarball,
}

impl BackendKind {
    /// Detection order. DEB and RPM carry unambiguous magic numbers and go first.
    /// An AppImage is an ELF executable with a squashfs image appended, so
    /// AppImage has to be probed before the generic ELF check of Binary.
    pub const PRIORITY: [BackendKind; 5] = [
        BackendKind::Deb,
        BackendKind::Rpm,
        BackendKind::AppImage,
        BackendKind::Binary,
        BackendKind::Tarball,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Deb => "deb",
            BackendKind::Rpm => "rpm",
            BackendKind::AppImage => "appimage",
            BackendKind::Binary => "binary",
            BackendKind::Tarball => "tarball",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BackendKind::Deb => "Debian packages (.deb)",
            BackendKind::Rpm => "RPM packages (.rpm)",
            BackendKind::AppImage => "AppImage bundles",
            BackendKind::Binary => "Standalone ELF executables",
            BackendKind::Tarball => "tar.gz, tar.xz, tar.bz2, tar.zst and zip archives",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name == "zip" {
            return Some(BackendKind::Tarball);
        }
        Self::PRIORITY.into_iter().find(|k| k.name() == name)
    }

    pub fn build(self, ctx: Arc<BackendContext>) -> Box<dyn Backend> {
        match self {
            BackendKind::Deb => Box::new(deb::DebBackend::new(ctx)),
            BackendKind::Rpm => Box::new(rpm::RpmBackend::new(ctx)),
            BackendKind::AppImage => Box::new(appimage::AppImageBackend::new(ctx)),
            BackendKind::Binary => Box::new(binary::BinaryBackend::new(ctx)),
            BackendKind::Tarball => Box::new(tarball::TarballBackend::new(ctx)),
        }
    }
}

impl From<PackageType> for BackendKind {
    fn from(value: PackageType) -> Self {
        match value {
            PackageType::Deb => BackendKind::Deb,
            PackageType::Rpm => BackendKind::Rpm,
            PackageType::AppImage => BackendKind::AppImage,
            PackageType::Binary => BackendKind::Binary,
            PackageType::Tarball | PackageType::Zip => BackendKind::Tarball,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Returns true if this backend can install `path`.
    async fn detect(&self, path: &Path) -> UpkgResult<bool>;

    /// Installs `path`, recording every side effect in `tx`.
    ///
    /// The caller persists the returned record and commits `tx`, or rolls it back.
    async fn install(
        &self,
        path: &Path,
        opts: &InstallOptions,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord>;

    /// Removes everything `record` owns. Missing files are not an error.
    async fn uninstall(&self, record: &InstallRecord) -> UpkgResult<()>;
}

/// Where installs put their artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    /// One directory per package below this.
    pub install_root: PathBuf,
    /// Wrapper scripts.
    pub bin_dir: PathBuf,
    pub applications_dir: PathBuf,
    pub icons_dir: PathBuf,
}

impl InstallPaths {
    /// Lays everything out below `root`, for tests and sandboxed runs.
    pub fn under(root: &Path) -> Self {
        Self {
            install_root: root.join("apps"),
            bin_dir: root.join("bin"),
            applications_dir: root.join("applications"),
            icons_dir: root.join("icons"),
        }
    }
}

/// Collaborators shared by every backend.
pub struct BackendContext {
    pub paths: InstallPaths,
    pub runner: Arc<dyn CommandRunner>,
    pub fs: Arc<dyn FileSystemProvider>,
    pub icons: Arc<dyn IconManager>,
    /// Wayland defaults followed by custom variables.
    pub launcher_env: Vec<EnvVar>,
    pub electron_disable_sandbox: bool,
    pub refresh_caches: bool,
}

impl BackendContext {
    pub fn new(paths: InstallPaths, runner: Arc<dyn CommandRunner>) -> Self {
        let icons = Arc::new(HicolorIconManager::new(&paths.icons_dir));
        Self {
            paths,
            runner,
            fs: Arc::new(StandardFileSystemProvider),
            icons,
            launcher_env: upkg_config::env::default_wayland_env(),
            electron_disable_sandbox: false,
            refresh_caches: true,
        }
    }

    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> UpkgResult<Self> {
        let paths = InstallPaths {
            install_root: config.get_install_path()?,
            bin_dir: config.get_bin_path()?,
            applications_dir: config.get_applications_path()?,
            icons_dir: config.get_icons_path()?,
        };

        let mut ctx = Self::new(paths, runner);
        ctx.launcher_env = config.launcher_env();
        ctx.electron_disable_sandbox = config.electron_disable_sandbox();
        ctx.refresh_caches = config.refresh_caches();
        Ok(ctx)
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.fs.clone(), self.runner.clone())
    }
}
