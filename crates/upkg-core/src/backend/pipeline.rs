//! Install steps shared by every backend.
//!
//! A backend only knows how to turn its package file into something runnable
//! (a [`Payload`]); naming, path claiming, executable selection, wrapper
//! scripts, icons and desktop entries happen here, each recorded in the
//! caller's [`Transaction`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};
use upkg_package::{
    asar::AsarArchive,
    desktop::{inject_wayland_env_vars, quote_exec_arg, DesktopEntry},
    humanize_name,
    icon::{select_icons, IconCandidate, InstalledIcon},
};
use upkg_utils::{
    error::LockError,
    fs::walk_dir,
    lock::FileLock,
    string::escape_double_quoted,
};

use super::BackendContext;
use crate::{
    error::{ErrorContext, UpkgError, UpkgResult},
    executable::{find_candidates, select_executable},
    naming::{install_id, name_from_filename, normalize_name},
    record::{
        ExtractedMeta, InstallMethod, InstallOptions, InstallRecord, Metadata, PackageType,
        WaylandSupport,
    },
    runner::{CommandSpec, CACHE_REFRESH_TIMEOUT, EXTRACT_TIMEOUT},
    transaction::{Step, Transaction},
};

/// Scratch directory inside the install directory for icons pulled out of archives.
const ICON_SCRATCH_DIR: &str = ".upkg-icons";

/// Name and version reported by the package's own metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// What a backend produced from the package file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// An unpacked tree. `entry_point` skips executable selection when set.
    Tree {
        root: PathBuf,
        entry_point: Option<PathBuf>,
    },
    /// A single executable placed in the install directory.
    Executable(PathBuf),
    /// Installed through the system package manager under this package name.
    SystemManaged { package: String },
}

/// Format-specific part of an install.
#[async_trait]
pub trait Materialize: Send + Sync {
    fn package_type(&self, source: &Path) -> PackageType;

    /// Best-effort metadata lookup; failures fall back to the file name.
    async fn query_metadata(&self, _ctx: &BackendContext, _source: &Path) -> PackageInfo {
        PackageInfo::default()
    }

    /// Unpacks `source` below `plan.install_dir`, which already exists and is
    /// owned by `tx`.
    async fn materialize(
        &self,
        ctx: &BackendContext,
        source: &Path,
        plan: &InstallPlan,
        tx: &mut Transaction,
    ) -> UpkgResult<Payload>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Display name.
    pub name: String,
    /// Lowercase name used for paths, icons and the lock.
    pub normalized: String,
    pub install_id: String,
    pub version: String,
    pub install_dir: PathBuf,
    pub wrapper_path: PathBuf,
    pub desktop_path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

/// An Electron app: the executable sits next to `resources/*.asar`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectronLayout {
    pub app_dir: PathBuf,
    pub archives: Vec<PathBuf>,
}

pub struct InstallPipeline<'a> {
    ctx: &'a BackendContext,
    opts: &'a InstallOptions,
}

impl<'a> InstallPipeline<'a> {
    pub fn new(ctx: &'a BackendContext, opts: &'a InstallOptions) -> Self {
        Self { ctx, opts }
    }

    /// Runs the whole install for `source`.
    pub async fn run<M>(
        &self,
        source: &Path,
        materializer: &M,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord>
    where
        M: Materialize + ?Sized,
    {
        if !source.is_file() {
            return Err(UpkgError::NotFound(format!(
                "Package file {}",
                source.display()
            )));
        }

        let info = materializer.query_metadata(self.ctx, source).await;
        let plan = self.plan(source, info)?;
        info!(pkg_name = %plan.name, install_id = %plan.install_id, "installing package");

        self.lock(&plan, tx).await?;
        self.claim_paths(&plan, tx)?;

        let payload = materializer.materialize(self.ctx, source, &plan, tx).await?;
        let mut record = self.base_record(&plan, source, materializer.package_type(source));

        let tree_root = match &payload {
            Payload::SystemManaged { package } => {
                // The install directory only served as scratch space.
                discard_scratch(self.ctx, &plan.install_dir);
                record.install_path = PathBuf::new();
                record.metadata.install_method = InstallMethod::PacmanManaged;
                record.metadata.system_package = Some(package.clone());
                refresh_caches(self.ctx).await;
                return Ok(record);
            }
            Payload::Tree { root, .. } => Some(root.clone()),
            Payload::Executable(_) => None,
        };

        let exe = self.resolve_executable(&payload, &plan)?;
        debug!(exe = %exe.display(), "selected executable");
        let electron = detect_electron(&exe);

        self.write_wrapper(&plan, &exe, electron.as_ref(), tx)?;
        record.metadata.wrapper_script = Some(plan.wrapper_path.clone());

        let icon_name = self
            .install_icons(
                &plan,
                tree_root.as_deref(),
                electron.as_ref(),
                tx,
                &mut record.metadata,
            )
            .await?;

        if !self.opts.skip_desktop {
            self.write_desktop_entries(
                &plan,
                tree_root.as_deref(),
                icon_name.as_deref(),
                tx,
                &mut record,
            )?;
        }

        record.metadata.wayland_support =
            detect_wayland_support(tree_root.as_deref(), electron.is_some());
        refresh_caches(self.ctx).await;

        info!(pkg_name = %plan.name, path = %plan.install_dir.display(), "installed package");
        Ok(record)
    }

    /// Resolves names and target paths.
    pub fn plan(&self, source: &Path, info: PackageInfo) -> UpkgResult<InstallPlan> {
        let custom = self
            .opts
            .custom_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from);
        let name = match custom.or(info.name.filter(|n| !n.trim().is_empty())) {
            Some(name) => name,
            None => {
                let file_name = source
                    .file_name()
                    .ok_or_else(|| {
                        UpkgError::InvalidInput(format!("{} has no file name", source.display()))
                    })?
                    .to_string_lossy();
                name_from_filename(&file_name)
            }
        };

        let normalized = normalize_name(&name)?;
        let installed_at = Utc::now();
        let paths = &self.ctx.paths;

        Ok(InstallPlan {
            install_id: install_id(&normalized, installed_at),
            version: info.version.unwrap_or_default(),
            install_dir: paths.install_root.join(&normalized),
            wrapper_path: paths.bin_dir.join(&normalized),
            desktop_path: paths.applications_dir.join(format!("{normalized}.desktop")),
            installed_at,
            name,
            normalized,
        })
    }

    async fn lock(&self, plan: &InstallPlan, tx: &mut Transaction) -> UpkgResult<()> {
        let name = plan.normalized.clone();
        let lock = tokio::task::spawn_blocking(move || FileLock::acquire(&name))
            .await
            .map_err(|e| LockError::AcquireFailed(e.to_string()))??;
        trace!(lock = %lock.path().display(), "acquired package lock");
        tx.hold_lock(lock);
        Ok(())
    }

    /// Fails with `AlreadyInstalled` if any target path exists, unless `force`
    /// is set, in which case existing artifacts are moved aside. Creates the
    /// install directory.
    fn claim_paths(&self, plan: &InstallPlan, tx: &mut Transaction) -> UpkgResult<()> {
        let targets = [&plan.install_dir, &plan.wrapper_path, &plan.desktop_path];
        let existing: Vec<&PathBuf> = targets
            .into_iter()
            .filter(|p| fs::symlink_metadata(p).is_ok())
            .collect();

        if !existing.is_empty() {
            if !self.opts.force {
                return Err(UpkgError::AlreadyInstalled(plan.name.clone()));
            }
            for path in existing {
                tx.move_aside(path)?;
            }
        }

        tx.create_dir_all(&plan.install_dir)
    }

    fn base_record(
        &self,
        plan: &InstallPlan,
        source: &Path,
        package_type: PackageType,
    ) -> InstallRecord {
        InstallRecord {
            install_id: plan.install_id.clone(),
            package_type,
            name: plan.name.clone(),
            version: plan.version.clone(),
            install_date: plan.installed_at,
            original_file: fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf()),
            install_path: plan.install_dir.clone(),
            desktop_file: None,
            metadata: Metadata::default(),
        }
    }

    fn resolve_executable(&self, payload: &Payload, plan: &InstallPlan) -> UpkgResult<PathBuf> {
        match payload {
            Payload::Executable(path) => Ok(path.clone()),
            Payload::Tree {
                entry_point: Some(entry),
                ..
            } if upkg_utils::fs::is_executable(entry) => Ok(entry.clone()),
            Payload::Tree { root, .. } => {
                let candidates = find_candidates(root)?;
                select_executable(&candidates, &plan.normalized, root)
                    .ok_or_else(|| UpkgError::NoExecutableFound(root.clone()))
            }
            Payload::SystemManaged { package } => {
                Err(UpkgError::InvalidInput(format!(
                    "{package} is managed by the system package manager"
                )))
            }
        }
    }

    fn write_wrapper(
        &self,
        plan: &InstallPlan,
        exe: &Path,
        electron: Option<&ElectronLayout>,
        tx: &mut Transaction,
    ) -> UpkgResult<()> {
        let script = wrapper_script(exe, electron, self.ctx.electron_disable_sandbox);
        tx.create_dir_all(&self.ctx.paths.bin_dir)?;
        tx.write_file(&plan.wrapper_path, script.as_bytes(), 0o755)?;
        debug!(wrapper = %plan.wrapper_path.display(), "wrote wrapper script");
        Ok(())
    }

    /// Installs the best icon per size bucket. Returns the icon name to put in
    /// `Icon=`, or `None` if nothing was installed.
    async fn install_icons(
        &self,
        plan: &InstallPlan,
        tree_root: Option<&Path>,
        electron: Option<&ElectronLayout>,
        tx: &mut Transaction,
        metadata: &mut Metadata,
    ) -> UpkgResult<Option<String>> {
        let mut candidates = Vec::new();
        if let Some(root) = tree_root {
            candidates.extend(
                self.ctx
                    .icons
                    .discover_icons(root)?
                    .into_iter()
                    .filter(|c| is_likely_app_icon(c, root, &plan.normalized)),
            );
        }
        if let Some(layout) = electron {
            let scratch = plan.install_dir.join(ICON_SCRATCH_DIR);
            self.extract_asar_icons(layout, &scratch, tx).await?;
            candidates.extend(self.ctx.icons.discover_icons(&scratch)?);
        }

        let selected = select_icons(&candidates, &plan.normalized);
        if selected.is_empty() {
            debug!(pkg_name = %plan.name, "no icons found");
            return Ok(None);
        }

        for candidate in selected {
            // Raster sizes read from the image get re-detected so the icon is resized.
            let size = candidate.source_px.is_none().then_some(candidate.size);
            let installed = self
                .ctx
                .icons
                .install_icon(&candidate.path, &plan.normalized, size)?;
            record_icon(tx, &installed);
            metadata.add_icon(installed.path);
        }

        Ok(Some(plan.normalized.clone()))
    }

    async fn extract_asar_icons(
        &self,
        layout: &ElectronLayout,
        scratch: &Path,
        tx: &mut Transaction,
    ) -> UpkgResult<()> {
        tx.create_dir_all(scratch)?;

        for archive_path in &layout.archives {
            match AsarArchive::open(archive_path) {
                Ok(archive) => {
                    for (idx, entry) in archive.icon_entries().into_iter().take(8).enumerate() {
                        let file_name = Path::new(&entry.path)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| format!("icon-{idx}.png"));
                        let dest = scratch.join(format!("{idx}-{file_name}"));
                        if let Err(err) = archive.extract(entry, &dest) {
                            warn!(
                                entry = %entry.path,
                                error = %err,
                                "failed to extract icon from asar"
                            );
                        }
                    }
                }
                Err(err) if self.ctx.runner.exists("asar") => {
                    debug!(
                        archive = %archive_path.display(),
                        error = %err,
                        "falling back to asar tool"
                    );
                    let dest = scratch.join("asar");
                    let spec = CommandSpec::new("asar")
                        .arg("extract")
                        .arg(archive_path.to_string_lossy())
                        .arg(dest.to_string_lossy())
                        .timeout(EXTRACT_TIMEOUT);
                    if let Err(err) = self.ctx.runner.run_checked(&spec).await {
                        warn!(
                            archive = %archive_path.display(),
                            error = %err,
                            "asar extraction failed"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        archive = %archive_path.display(),
                        error = %err,
                        "unreadable asar archive"
                    );
                }
            }
        }
        Ok(())
    }

    fn write_desktop_entries(
        &self,
        plan: &InstallPlan,
        tree_root: Option<&Path>,
        icon_name: Option<&str>,
        tx: &mut Transaction,
        record: &mut InstallRecord,
    ) -> UpkgResult<()> {
        let wrapper = plan.wrapper_path.to_string_lossy().into_owned();
        let bundled = match tree_root {
            Some(root) => find_bundled_desktop_files(root, &plan.normalized)?,
            None => Vec::new(),
        };

        let mut primary_program = None;
        let mut entry = match bundled.first().map(|p| read_desktop_file(p)) {
            Some(Ok(mut entry)) => {
                record.metadata.extracted_meta = Some(harvest_meta(&entry));
                primary_program = entry.get("Exec").and_then(exec_program);
                entry.rewrite_exec(&wrapper);
                if let Some(icon) = icon_name {
                    entry.set("Icon", icon);
                }
                entry
            }
            Some(Err(err)) => {
                warn!(error = %err, "ignoring unreadable bundled desktop file");
                synthesize_entry(plan, &wrapper, icon_name)
            }
            None => synthesize_entry(plan, &wrapper, icon_name),
        };
        self.finish_entry(&mut entry)?;

        tx.create_dir_all(&self.ctx.paths.applications_dir)?;
        tx.write_file(&plan.desktop_path, entry.to_string().as_bytes(), 0o644)?;
        debug!(desktop = %plan.desktop_path.display(), "wrote desktop entry");
        record.desktop_file = Some(plan.desktop_path.clone());
        record.metadata.desktop_files.push(plan.desktop_path.clone());

        // Extra launchers shipped by the package that start the same program.
        for extra in bundled.iter().skip(1) {
            let Ok(mut entry) = read_desktop_file(extra) else {
                continue;
            };
            let program = entry.get("Exec").and_then(exec_program);
            if program.is_none() || program != primary_program {
                trace!(desktop = %extra.display(), "skipping unrelated desktop file");
                continue;
            }
            entry.rewrite_exec(&wrapper);
            if let Some(icon) = icon_name {
                entry.set("Icon", icon);
            }
            self.finish_entry(&mut entry)?;

            let stem = extra
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let path = self
                .ctx
                .paths
                .applications_dir
                .join(format!("{}-{}.desktop", plan.normalized, stem));
            tx.write_file(&path, entry.to_string().as_bytes(), 0o644)?;
            record.metadata.desktop_files.push(path);
        }

        Ok(())
    }

    fn finish_entry(&self, entry: &mut DesktopEntry) -> UpkgResult<()> {
        if !self.opts.skip_wayland_env {
            inject_wayland_env_vars(entry, &self.ctx.launcher_env)?;
        }
        entry.validate()?;
        Ok(())
    }
}

fn record_icon(tx: &mut Transaction, installed: &InstalledIcon) {
    for dir in &installed.created_dirs {
        tx.record(Step::created_dir(dir));
    }
    for change in std::iter::once(&installed.icon_change).chain(installed.index_change.as_ref()) {
        let step = match &change.original {
            None => Step::created_file(&change.path),
            Some(original) => Step::modified_file(&change.path, Some(original.clone())),
        };
        tx.record(step);
    }
}

/// Keeps icons named after the package, icons in theme-like directories and
/// icons at the top of the tree; drops UI assets buried in the app.
fn is_likely_app_icon(candidate: &IconCandidate, root: &Path, name: &str) -> bool {
    let relative = candidate.path.strip_prefix(root).unwrap_or(&candidate.path);
    let stem = candidate
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let rel = format!("/{}", relative.to_string_lossy().to_ascii_lowercase());

    if rel.contains("/node_modules/") {
        return false;
    }
    stem.contains(name)
        || matches!(stem.as_str(), "icon" | "logo" | "app")
        || rel.contains("/icons/")
        || rel.contains("/pixmaps/")
        || relative.components().count() == 1
}

pub fn detect_electron(exe: &Path) -> Option<ElectronLayout> {
    let app_dir = exe.parent()?;
    let resources = app_dir.join("resources");
    let mut archives: Vec<PathBuf> = fs::read_dir(&resources)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "asar") && p.is_file())
        .collect();
    if archives.is_empty() {
        return None;
    }
    archives.sort();
    Some(ElectronLayout {
        app_dir: app_dir.to_path_buf(),
        archives,
    })
}

pub fn wrapper_script(exe: &Path, electron: Option<&ElectronLayout>, no_sandbox: bool) -> String {
    let exe = escape_double_quoted(&exe.to_string_lossy());
    let mut script = String::from("#!/bin/bash\n");
    match electron {
        Some(layout) => {
            let dir = escape_double_quoted(&layout.app_dir.to_string_lossy());
            script.push_str(&format!("cd \"{dir}\" || exit 1\n"));
            let flag = if no_sandbox { " --no-sandbox" } else { "" };
            script.push_str(&format!("exec \"{exe}\"{flag} \"$@\"\n"));
        }
        None => script.push_str(&format!("exec \"{exe}\" \"$@\"\n")),
    }
    script
}

/// `.desktop` files in the tree, best match for `name` first.
fn find_bundled_desktop_files(root: &Path, name: &str) -> UpkgResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk_dir(root, &mut |path: &Path| -> UpkgResult<()> {
        if path.extension().is_some_and(|e| e == "desktop")
            && !path.to_string_lossy().contains("/autostart/")
        {
            found.push(path.to_path_buf());
        }
        Ok(())
    })?;

    let rank = |p: &PathBuf| {
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let in_applications = p.to_string_lossy().contains("/share/applications/");
        match (stem == name, stem.contains(name), in_applications) {
            (true, _, _) => 0,
            (_, true, true) => 1,
            (_, true, false) => 2,
            (_, _, true) => 3,
            _ => 4,
        }
    };
    found.sort_by_key(rank);
    Ok(found)
}

fn read_desktop_file(path: &Path) -> UpkgResult<DesktopEntry> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(DesktopEntry::parse(std::io::BufReader::new(file))?)
}

fn synthesize_entry(plan: &InstallPlan, wrapper: &str, icon_name: Option<&str>) -> DesktopEntry {
    let exec = format!("{} %U", quote_exec_arg(wrapper));
    let mut entry = DesktopEntry::application(&humanize_name(&plan.name), &exec, icon_name);
    entry.set("Categories", "Utility;");
    entry
}

fn harvest_meta(entry: &DesktopEntry) -> ExtractedMeta {
    ExtractedMeta {
        categories: entry
            .get("Categories")
            .map(|c| {
                c.split(';')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        comment: entry.get("Comment").map(String::from),
        startup_wm_class: entry.get("StartupWMClass").map(String::from),
    }
}

/// Base name of the program an `Exec=` line starts, skipping an `env` prefix.
fn exec_program(exec: &str) -> Option<String> {
    let program = upkg_package::desktop::exec_program(exec)?;
    Path::new(&program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

fn detect_wayland_support(tree_root: Option<&Path>, electron: bool) -> WaylandSupport {
    if electron {
        return WaylandSupport::Hybrid;
    }
    let Some(root) = tree_root else {
        return WaylandSupport::Unknown;
    };

    let mut wayland = false;
    let mut x11 = false;
    let scanned = walk_dir(root, &mut |path: &Path| -> UpkgResult<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.starts_with("libwayland-client") || name.contains("waylandclient") {
            wayland = true;
        }
        if name.starts_with("libx11") || name.starts_with("libxcb") {
            x11 = true;
        }
        Ok(())
    });
    if let Err(err) = scanned {
        warn!(root = %root.display(), error = %err, "incomplete scan for display libraries");
    }

    match (wayland, x11) {
        (true, true) => WaylandSupport::Hybrid,
        (true, false) => WaylandSupport::Native,
        (false, true) => WaylandSupport::XWayland,
        (false, false) => WaylandSupport::Unknown,
    }
}

/// Removes scratch files left by extraction. Failures are only logged.
pub fn discard_scratch(ctx: &BackendContext, path: &Path) {
    if let Err(err) = ctx.fs.safe_remove(path) {
        warn!(path = %path.display(), error = %err, "failed to remove scratch files");
    }
}

/// Refreshes the desktop database and icon cache. Failures are only logged.
pub async fn refresh_caches(ctx: &BackendContext) {
    if !ctx.refresh_caches {
        return;
    }

    let hicolor = ctx.paths.icons_dir.join("hicolor");
    let mut jobs = vec![CommandSpec::new("update-desktop-database")
        .arg(ctx.paths.applications_dir.to_string_lossy())];
    if hicolor.is_dir() {
        jobs.push(
            CommandSpec::new("gtk-update-icon-cache")
                .args(["-f", "-t"])
                .arg(hicolor.to_string_lossy()),
        );
    }

    for spec in jobs {
        if !ctx.runner.exists(&spec.program) {
            trace!(program = %spec.program, "cache tool not installed");
            continue;
        }
        let spec = spec.timeout(CACHE_REFRESH_TIMEOUT);
        if let Err(err) = ctx.runner.run_checked(&spec).await {
            warn!(error = %err, "cache refresh failed");
        }
    }
}

/// Uninstalls `record` the way it was installed.
pub async fn remove_install(ctx: &BackendContext, record: &InstallRecord) -> UpkgResult<()> {
    match (record.metadata.install_method, &record.metadata.system_package) {
        (InstallMethod::PacmanManaged, Some(package)) => {
            super::system::remove_package(ctx, package).await?;
            refresh_caches(ctx).await;
            Ok(())
        }
        (InstallMethod::PacmanManaged, None) => {
            Err(UpkgError::PersistenceFailure(format!(
                "record {} is pacman-managed but names no package",
                record.install_id
            )))
        }
        (InstallMethod::Local, _) => remove_local_install(ctx, record).await,
    }
}

/// Removes every artifact of a locally extracted install, then refreshes caches.
///
/// Missing files are skipped, so running this twice is harmless.
pub async fn remove_local_install(ctx: &BackendContext, record: &InstallRecord) -> UpkgResult<()> {
    let mut first_error = None;
    for path in record.artifacts() {
        trace!(path = %path.display(), "removing");
        if let Err(err) = ctx.fs.safe_remove(&path) {
            warn!(path = %path.display(), error = %err, "failed to remove");
            first_error.get_or_insert(err);
        }
    }

    refresh_caches(ctx).await;

    match first_error {
        Some(err) => Err(err.into()),
        None => {
            info!(pkg_name = %record.name, "removed package files");
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for backend tests.

    use std::{os::unix::fs::PermissionsExt, sync::Arc};

    use upkg_utils::fs::ELF_MAGIC_BYTES;

    use super::*;
    use crate::{backend::InstallPaths, runner::mock::MockCommandRunner};

    pub fn context(root: &Path, runner: MockCommandRunner) -> BackendContext {
        let mut ctx = BackendContext::new(InstallPaths::under(root), Arc::new(runner));
        ctx.refresh_caches = false;
        ctx
    }

    pub fn write_elf(path: &Path, size: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut bytes = ELF_MAGIC_BYTES.to_vec();
        bytes.resize(size.max(64), 0);
        fs::write(path, bytes).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn write_png(path: &Path, px: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img: image::ImageBuffer<image::Rgba<u8>, Vec<u8>> = image::ImageBuffer::new(px, px);
        img.save(path).unwrap();
    }

    /// Every file below `dir`, relative.
    pub fn files_below(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let _ = walk_dir(dir, &mut |p: &Path| -> UpkgResult<()> {
            out.push(p.strip_prefix(dir).unwrap().to_path_buf());
            Ok(())
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use upkg_utils::{
        error::{FileSystemError, FileSystemResult},
        fs::{FileSystemProvider, StandardFileSystemProvider},
    };

    use super::{test_support::*, *};
    use crate::runner::mock::MockCommandRunner;

    /// Copies a prepared tree into the install directory.
    struct TreeFixture {
        tree: PathBuf,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Materialize for TreeFixture {
        fn package_type(&self, _source: &Path) -> PackageType {
            PackageType::Tarball
        }

        async fn materialize(
            &self,
            _ctx: &BackendContext,
            _source: &Path,
            plan: &InstallPlan,
            _tx: &mut Transaction,
        ) -> UpkgResult<Payload> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(UpkgError::ExternalToolFailure {
                    command: "tar".into(),
                    reason: "boom".into(),
                });
            }
            walk_dir(&self.tree, &mut |p: &Path| -> UpkgResult<()> {
                let dest = plan.install_dir.join(p.strip_prefix(&self.tree).unwrap());
                fs::create_dir_all(dest.parent().unwrap()).unwrap();
                fs::copy(p, &dest).unwrap();
                Ok(())
            })?;
            Ok(Payload::Tree {
                root: plan.install_dir.clone(),
                entry_point: None,
            })
        }
    }

    fn fixture(dir: &Path) -> TreeFixture {
        let tree = dir.join("tree");
        write_elf(&tree.join("myapp/bin/myapp"), 2 * 1024 * 1024);
        write_elf(&tree.join("myapp/bin/myapp-updater"), 1024);
        write_png(&tree.join("myapp/share/icons/hicolor/64x64/apps/myapp.png"), 64);
        TreeFixture {
            tree,
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    fn source(dir: &Path) -> PathBuf {
        let source = dir.join("myapp-1.2.3.tar.gz");
        fs::write(&source, b"placeholder").unwrap();
        source
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions::default();
        let fixture = fixture(dir.path());
        let source = source(dir.path());

        let mut tx = ctx.transaction();
        let record = InstallPipeline::new(&ctx, &opts)
            .run(&source, &fixture, &mut tx)
            .await
            .unwrap();
        tx.commit();

        assert_eq!(record.name, "myapp");
        assert!(record.install_id.starts_with("myapp-"));
        assert_eq!(record.install_path, root.join("apps/myapp"));

        let wrapper = fs::read_to_string(root.join("bin/myapp")).unwrap();
        assert_eq!(
            wrapper,
            format!(
                "#!/bin/bash\nexec \"{}\" \"$@\"\n",
                root.join("apps/myapp/myapp/bin/myapp").display()
            )
        );

        let icon = root.join("icons/hicolor/64x64/apps/myapp.png");
        assert!(icon.exists());
        assert_eq!(record.metadata.icon_files, vec![icon]);

        let desktop = fs::read_to_string(root.join("applications/myapp.desktop")).unwrap();
        assert!(desktop.contains("Name=Myapp"));
        assert!(desktop.contains("Icon=myapp"));
        assert!(desktop.contains("Exec=env GDK_BACKEND=wayland,x11"));
        assert_eq!(record.desktop_file, Some(root.join("applications/myapp.desktop")));
    }

    #[tokio::test]
    async fn test_remove_local_install_twice() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions::default();
        let fixture = fixture(dir.path());
        let source = source(dir.path());

        let mut tx = ctx.transaction();
        let record = InstallPipeline::new(&ctx, &opts)
            .run(&source, &fixture, &mut tx)
            .await
            .unwrap();
        tx.commit();

        remove_install(&ctx, &record).await.unwrap();
        assert!(!root.join("apps/myapp").exists());
        assert!(!root.join("bin/myapp").exists());
        assert!(!root.join("applications/myapp.desktop").exists());
        assert!(!root.join("icons/hicolor/64x64/apps/myapp.png").exists());

        remove_install(&ctx, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_already_installed_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let fixture = fixture(dir.path());
        let source = source(dir.path());
        fs::create_dir_all(root.join("apps/myapp")).unwrap();

        let opts = InstallOptions::default();
        let mut tx = ctx.transaction();
        let err = InstallPipeline::new(&ctx, &opts)
            .run(&source, &fixture, &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UpkgError::AlreadyInstalled(_)));
        tx.rollback().await.unwrap();
        assert!(root.join("apps/myapp").exists());

        let opts = InstallOptions {
            force: true,
            ..Default::default()
        };
        let mut tx = ctx.transaction();
        InstallPipeline::new(&ctx, &opts)
            .run(&source, &fixture, &mut tx)
            .await
            .unwrap();
        tx.commit();
        assert!(root.join("apps/myapp/myapp/bin/myapp").exists());
        assert!(!root.join("apps/.myapp.upkg-backup").exists());
    }

    #[tokio::test]
    async fn test_desktop_failure_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        // A file where the applications directory should be makes the desktop step fail.
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("applications"), "not a directory").unwrap();

        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions::default();
        let fixture = fixture(dir.path());
        let source = source(dir.path());

        let mut tx = ctx.transaction();
        let result = InstallPipeline::new(&ctx, &opts)
            .run(&source, &fixture, &mut tx)
            .await;
        assert!(result.is_err());
        // Wrapper and icons were written before the failure.
        assert!(root.join("bin/myapp").exists());
        assert!(root.join("icons/hicolor/64x64/apps/myapp.png").exists());

        tx.rollback().await.unwrap();
        assert_eq!(files_below(&root), vec![PathBuf::from("applications")]);
        assert!(!root.join("apps").exists());
        assert!(!root.join("bin").exists());
        assert!(!root.join("icons").exists());
    }

    #[tokio::test]
    async fn test_icon_failure_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let index = root.join("icons/hicolor/index.theme");
        fs::create_dir_all(index.parent().unwrap()).unwrap();
        fs::write(&index, "[Icon Theme]\ngarbage\n").unwrap();

        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions::default();
        let fixture = fixture(dir.path());
        let source = source(dir.path());

        let mut tx = ctx.transaction();
        let result = InstallPipeline::new(&ctx, &opts)
            .run(&source, &fixture, &mut tx)
            .await;
        assert!(result.is_err());

        tx.rollback().await.unwrap();
        assert_eq!(
            files_below(&root),
            vec![PathBuf::from("icons/hicolor/index.theme")]
        );
        assert!(!root.join("icons/hicolor/64x64").exists());
        assert!(!root.join("apps").exists());
        assert!(!root.join("bin").exists());
        assert!(!root.join("applications").exists());
    }

    /// Filesystem that refuses to delete anything.
    struct NoDeleteFs;

    impl FileSystemProvider for NoDeleteFs {
        fn safe_remove(&self, path: &Path) -> FileSystemResult<()> {
            Err(FileSystemError::File {
                path: path.to_path_buf(),
                action: "remove",
                source: std::io::ErrorKind::PermissionDenied.into(),
            })
        }

        fn ensure_dir_exists(&self, path: &Path) -> FileSystemResult<()> {
            StandardFileSystemProvider.ensure_dir_exists(path)
        }

        fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> FileSystemResult<()> {
            StandardFileSystemProvider.write_file(path, contents, mode)
        }

        fn rename(&self, from: &Path, to: &Path) -> FileSystemResult<()> {
            StandardFileSystemProvider.rename(from, to)
        }
    }

    /// Hands the package to the system package manager.
    struct PacmanFixture;

    #[async_trait]
    impl Materialize for PacmanFixture {
        fn package_type(&self, _source: &Path) -> PackageType {
            PackageType::Deb
        }

        async fn materialize(
            &self,
            _ctx: &BackendContext,
            _source: &Path,
            _plan: &InstallPlan,
            _tx: &mut Transaction,
        ) -> UpkgResult<Payload> {
            Ok(Payload::SystemManaged {
                package: "tool".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_scratch_cleanup_failure_keeps_install() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let mut ctx = context(&root, MockCommandRunner::new());
        ctx.fs = Arc::new(NoDeleteFs);
        let opts = InstallOptions::default();
        let source = dir.path().join("scratchtool-1.0.deb");
        fs::write(&source, b"placeholder").unwrap();

        let mut tx = ctx.transaction();
        let record = InstallPipeline::new(&ctx, &opts)
            .run(&source, &PacmanFixture, &mut tx)
            .await
            .unwrap();
        tx.commit();

        assert_eq!(record.metadata.install_method, InstallMethod::PacmanManaged);
        assert_eq!(record.metadata.system_package.as_deref(), Some("tool"));
        assert!(record.install_path.as_os_str().is_empty());
    }

    #[tokio::test]
    async fn test_materialize_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions::default();
        let fixture = fixture(dir.path());
        fixture.fail.store(true, Ordering::SeqCst);

        let mut tx = ctx.transaction();
        let result = InstallPipeline::new(&ctx, &opts)
            .run(&source(dir.path()), &fixture, &mut tx)
            .await;
        assert!(result.is_err());
        tx.rollback().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_no_executable_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions::default();
        let tree = dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("README"), "docs only").unwrap();
        let fixture = TreeFixture {
            tree,
            fail: Arc::new(AtomicBool::new(false)),
        };

        let mut tx = ctx.transaction();
        let err = InstallPipeline::new(&ctx, &opts)
            .run(&source(dir.path()), &fixture, &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UpkgError::NoExecutableFound(_)));
        tx.rollback().await.unwrap();
        assert!(!root.join("apps/myapp").exists());
    }

    #[tokio::test]
    async fn test_bundled_desktop_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions {
            custom_name: Some("My App".into()),
            skip_wayland_env: true,
            ..Default::default()
        };
        let fixture = fixture(dir.path());
        fs::create_dir_all(fixture.tree.join("myapp/share/applications")).unwrap();
        fs::write(
            fixture.tree.join("myapp/share/applications/myapp.desktop"),
            "[Desktop Entry]\nType=Application\nName=My App\nExec=/usr/bin/myapp %F\n\
             Categories=Development;IDE;\nComment=Edit things\nStartupWMClass=MyApp\n",
        )
        .unwrap();

        let mut tx = ctx.transaction();
        let record = InstallPipeline::new(&ctx, &opts)
            .run(&source(dir.path()), &fixture, &mut tx)
            .await
            .unwrap();
        tx.commit();

        assert_eq!(record.name, "My App");
        let desktop_path = root.join("applications/my-app.desktop");
        let desktop = fs::read_to_string(&desktop_path).unwrap();
        assert!(desktop.contains(&format!("Exec={} %F", root.join("bin/my-app").display())));
        assert!(!desktop.contains("env "));

        let meta = record.metadata.extracted_meta.unwrap();
        assert_eq!(meta.categories, vec!["Development", "IDE"]);
        assert_eq!(meta.comment.as_deref(), Some("Edit things"));
        assert_eq!(meta.startup_wm_class.as_deref(), Some("MyApp"));
    }

    #[tokio::test]
    async fn test_skip_desktop() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let ctx = context(&root, MockCommandRunner::new());
        let opts = InstallOptions {
            skip_desktop: true,
            ..Default::default()
        };
        let mut tx = ctx.transaction();
        let record = InstallPipeline::new(&ctx, &opts)
            .run(&source(dir.path()), &fixture(dir.path()), &mut tx)
            .await
            .unwrap();
        tx.commit();
        assert!(record.desktop_file.is_none());
        assert!(!root.join("applications").exists());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), MockCommandRunner::new());
        let opts = InstallOptions::default();
        let mut tx = ctx.transaction();
        let err = InstallPipeline::new(&ctx, &opts)
            .run(&dir.path().join("nope.deb"), &fixture(dir.path()), &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UpkgError::NotFound(_)));
    }

    #[test]
    fn test_electron_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("App/app");
        write_elf(&exe, 64);
        fs::create_dir_all(dir.path().join("App/resources")).unwrap();
        fs::write(dir.path().join("App/resources/app.asar"), b"x").unwrap();

        let layout = detect_electron(&exe).unwrap();
        assert_eq!(layout.app_dir, dir.path().join("App"));
        let script = wrapper_script(&exe, Some(&layout), true);
        assert!(script.contains(&format!("cd \"{}\" || exit 1", dir.path().join("App").display())));
        assert!(script.ends_with("--no-sandbox \"$@\"\n"));

        assert!(detect_electron(&dir.path().join("elsewhere/app")).is_none());
    }

    #[test]
    fn test_wayland_scan_survives_unreadable_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let libs = dir.path().join("a-lib");
        fs::create_dir_all(&libs).unwrap();
        fs::write(libs.join("libwayland-client.so.0"), b"").unwrap();
        fs::write(libs.join("libX11.so.6"), b"").unwrap();
        let locked = dir.path().join("z-locked");
        fs::create_dir_all(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let support = detect_wayland_support(Some(dir.path()), false);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(support, WaylandSupport::Hybrid);
        assert_eq!(detect_wayland_support(None, false), WaylandSupport::Unknown);
        assert_eq!(detect_wayland_support(None, true), WaylandSupport::Hybrid);
    }

    #[test]
    fn test_exec_program() {
        assert_eq!(exec_program("/usr/bin/code %F").as_deref(), Some("code"));
        assert_eq!(
            exec_program("env A=1 B=2 \"/opt/My App/app\" --x").as_deref(),
            Some("app")
        );
        assert_ne!(
            exec_program("\"/opt/My App/app\" %U"),
            exec_program("\"/opt/My Tools/other-tool\" --settings")
        );
        assert_eq!(exec_program("env A=1 app").as_deref(), Some("app"));
        assert_eq!(exec_program("").as_deref(), None);
    }
}
