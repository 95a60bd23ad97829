//! Icon discovery and hicolor theme placement.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fmt, fs,
    path::{Component, Path, PathBuf},
    sync::LazyLock,
};

use image::imageops::FilterType;
use regex::Regex;
use tracing::{debug, trace, warn};
use upkg_utils::fs::walk_dir;

use crate::{
    desktop::{DesktopEntry, DesktopGroup},
    error::{ErrorContext, PackageError, Result},
};

/// Sizes the hicolor theme is populated with.
pub const STANDARD_SIZES: &[u32] = &[16, 22, 24, 32, 48, 64, 128, 256, 512];

const THEME_NAME: &str = "hicolor";
const THEME_GROUP: &str = "Icon Theme";
const ICON_EXTENSIONS: &[&str] = &["png", "svg", "xpm"];

static SIZE_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"^(\d{1,4})x(\d{1,4})(@\d+)?$").expect("unable to compile size regex")
    });

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IconSize {
    Fixed(u32),
    Scalable,
}

impl IconSize {
    /// Snaps a pixel size to the nearest standard size. Ties go to the larger size.
    pub fn normalize(px: u32) -> Self {
        let nearest = STANDARD_SIZES
            .iter()
            .copied()
            .min_by_key(|&s| (s.abs_diff(px), std::cmp::Reverse(s)))
            .unwrap_or(48);
        Self::Fixed(nearest)
    }

    /// Directory name inside the theme (`48x48`, `scalable`).
    pub fn dir_name(&self) -> String {
        self.to_string()
    }

    fn nominal(&self) -> u32 {
        match self {
            IconSize::Fixed(px) => *px,
            IconSize::Scalable => 128,
        }
    }
}

impl fmt::Display for IconSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IconSize::Fixed(px) => write!(f, "{px}x{px}"),
            IconSize::Scalable => f.write_str("scalable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconCandidate {
    pub path: PathBuf,
    /// Already normalized.
    pub size: IconSize,
    /// Pixel width as found, before normalization. `None` for vector icons.
    pub source_px: Option<u32>,
}

/// Snapshot of a file taken before it was changed, so the change can be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    /// Previous contents, `None` if the file did not exist.
    pub original: Option<Vec<u8>>,
}

/// Everything `install_icon` touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledIcon {
    pub path: PathBuf,
    pub size: IconSize,
    /// Directories created, outermost first.
    pub created_dirs: Vec<PathBuf>,
    pub icon_change: FileChange,
    pub index_change: Option<FileChange>,
}

pub trait IconManager: Send + Sync {
    /// Finds icon files below `dir`, each tagged with its normalized size.
    fn discover_icons(&self, dir: &Path) -> Result<Vec<IconCandidate>>;

    /// Copies `src` into the theme as `<name>.<ext>` under the size bucket, registering
    /// the bucket in `index.theme`. The size is detected when not given.
    fn install_icon(&self, src: &Path, name: &str, size: Option<IconSize>) -> Result<InstalledIcon>;

    /// Path `install_icon` would write for the given name, size and extension.
    fn icon_path(&self, name: &str, size: IconSize, ext: &str) -> PathBuf;
}

/// Icon manager for a hicolor theme rooted at `<icons_dir>/hicolor`.
#[derive(Debug, Clone)]
pub struct HicolorIconManager {
    theme_dir: PathBuf,
}

impl HicolorIconManager {
    pub fn new<P: AsRef<Path>>(icons_dir: P) -> Self {
        Self {
            theme_dir: icons_dir.as_ref().join(THEME_NAME),
        }
    }

    pub fn theme_dir(&self) -> &Path {
        &self.theme_dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.theme_dir.join("index.theme")
    }

    /// Adds `size` to `Directories=` and writes its section if missing.
    /// Returns the snapshot of the previous index if it changed.
    fn register_size(&self, size: IconSize) -> Result<Option<FileChange>> {
        let index_path = self.index_path();
        let original = match fs::read(&index_path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(PackageError::IoError {
                    action: format!("reading {}", index_path.display()),
                    source: err,
                })
            }
        };

        let mut index = match &original {
            Some(bytes) => DesktopEntry::parse(bytes.as_slice())?,
            None => default_index(),
        };

        let section = format!("{}/apps", size.dir_name());
        let mut changed = original.is_none();

        if index.group(THEME_GROUP).is_none() {
            changed = true;
        }
        let theme = index.ensure_group(THEME_GROUP);
        let mut dirs: Vec<String> = theme
            .get("Directories")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from)
            .collect();
        if !dirs.contains(&section) {
            dirs.push(section.clone());
            theme.set("Directories", dirs.join(","));
            changed = true;
        }

        if index.group(&section).is_none() {
            index.push_group(section_group(&section, size));
            changed = true;
        }

        if !changed {
            return Ok(None);
        }

        fs::write(&index_path, index.to_string())
            .with_context(|| format!("writing {}", index_path.display()))?;
        debug!(index = %index_path.display(), section = %section, "updated icon theme index");

        Ok(Some(FileChange {
            path: index_path,
            original,
        }))
    }
}

fn default_index() -> DesktopEntry {
    let mut index = DesktopEntry::default();
    let theme = index.ensure_group(THEME_GROUP);
    theme.set("Name", "Hicolor");
    theme.set("Comment", "Fallback icon theme");
    theme.set("Hidden", "true");
    theme.set("Directories", "");
    index
}

fn section_group(section: &str, size: IconSize) -> DesktopGroup {
    let mut group = DesktopGroup::new(section);
    match size {
        IconSize::Fixed(px) => {
            group.set("Size", px.to_string());
            group.set("Context", "Applications");
            group.set("Type", "Threshold");
        }
        IconSize::Scalable => {
            group.set("Size", "128");
            group.set("MinSize", "8");
            group.set("MaxSize", "512");
            group.set("Context", "Applications");
            group.set("Type", "Scalable");
        }
    }
    group
}

/// Reads a size hint from path components such as `48x48` or `scalable`.
fn size_from_path(path: &Path) -> Option<IconSize> {
    path.components().rev().find_map(|c| {
        let Component::Normal(part) = c else {
            return None;
        };
        let part = part.to_string_lossy();
        if part == "scalable" {
            return Some(IconSize::Scalable);
        }
        let caps = SIZE_DIR_RE.captures(&part)?;
        let w: u32 = caps[1].parse().ok()?;
        Some(IconSize::normalize(w))
    })
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

/// Determines the size bucket of an icon file and its pixel width, if raster.
pub fn detect_size(path: &Path) -> Result<(IconSize, Option<u32>)> {
    let ext = extension(path)
        .ok_or_else(|| PackageError::UnsupportedIcon(path.display().to_string()))?;
    if ext == "svg" {
        return Ok((IconSize::Scalable, None));
    }

    match image::image_dimensions(path) {
        Ok((w, h)) => Ok((IconSize::normalize(w.max(h)), Some(w.max(h)))),
        Err(err) => {
            // XPM and broken rasters: fall back to the directory convention.
            match size_from_path(path) {
                Some(size) => Ok((size, None)),
                None => Err(err.into()),
            }
        }
    }
}

impl IconManager for HicolorIconManager {
    fn discover_icons(&self, dir: &Path) -> Result<Vec<IconCandidate>> {
        let mut found = Vec::new();

        walk_dir(dir, &mut |path: &Path| -> Result<()> {
            let Some(ext) = extension(path) else {
                return Ok(());
            };
            if !ICON_EXTENSIONS.contains(&ext.as_str()) {
                return Ok(());
            }

            let (size, source_px) = match size_from_path(path) {
                Some(size) => (size, None),
                None => {
                    match detect_size(path) {
                        Ok(detected) => detected,
                        Err(err) => {
                            trace!(
                                path = %path.display(),
                                error = %err,
                                "skipping unreadable icon"
                            );
                            return Ok(());
                        }
                    }
                }
            };

            found.push(IconCandidate {
                path: path.to_path_buf(),
                size,
                source_px,
            });
            Ok(())
        })?;

        debug!(dir = %dir.display(), count = found.len(), "discovered icons");
        Ok(found)
    }

    fn install_icon(
        &self,
        src: &Path,
        name: &str,
        size: Option<IconSize>,
    ) -> Result<InstalledIcon> {
        let ext = extension(src)
            .filter(|e| ICON_EXTENSIONS.contains(&e.as_str()))
            .ok_or_else(|| PackageError::UnsupportedIcon(src.display().to_string()))?;

        let (size, source_px) = match size {
            Some(size) => (size, None),
            None => detect_size(src)?,
        };
        let size = if ext == "svg" { IconSize::Scalable } else { size };

        let dest = self.icon_path(name, size, &ext);
        let Some(dest_dir) = dest.parent() else {
            return Err(PackageError::UnsupportedIcon(dest.display().to_string()));
        };

        let mut created_dirs = Vec::new();
        let mut missing = Some(dest_dir);
        while let Some(dir) = missing {
            if dir.exists() {
                break;
            }
            created_dirs.insert(0, dir.to_path_buf());
            missing = dir.parent();
        }

        let resize_to = match (size, source_px, ext.as_str()) {
            (IconSize::Fixed(px), Some(src_px), "png") if src_px != px => Some(px),
            _ => None,
        };
        let icon_change = FileChange {
            path: dest.clone(),
            original: fs::read(&dest).ok(),
        };

        let placed = place_icon(src, &dest, dest_dir, resize_to)
            .and_then(|()| self.register_size(size));
        let index_change = match placed {
            Ok(change) => change,
            Err(err) => {
                revert_icon(&icon_change, &created_dirs);
                return Err(err);
            }
        };
        debug!(icon = %dest.display(), %size, "installed icon");

        Ok(InstalledIcon {
            path: dest,
            size,
            created_dirs,
            icon_change,
            index_change,
        })
    }

    fn icon_path(&self, name: &str, size: IconSize, ext: &str) -> PathBuf {
        self.theme_dir
            .join(size.dir_name())
            .join("apps")
            .join(format!("{name}.{ext}"))
    }
}

/// Writes `src` to `dest`, resized to `resize_to` pixels when set.
fn place_icon(src: &Path, dest: &Path, dest_dir: &Path, resize_to: Option<u32>) -> Result<()> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating directory {}", dest_dir.display()))?;

    match resize_to {
        Some(px) => {
            let img = image::open(src)?;
            img.resize(px, px, FilterType::Lanczos3).save(dest)?;
            trace!(src = %src.display(), px, "resized icon");
        }
        None => {
            fs::copy(src, dest).with_context(|| {
                format!("copying {} to {}", src.display(), dest.display())
            })?;
        }
    }
    Ok(())
}

/// Undoes a partly installed icon: restores or removes the file, then removes the
/// directories created for it.
fn revert_icon(change: &FileChange, created_dirs: &[PathBuf]) {
    let restored = match &change.original {
        Some(bytes) => fs::write(&change.path, bytes),
        None => {
            match fs::remove_file(&change.path) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
    };
    if let Err(err) = restored {
        warn!(icon = %change.path.display(), error = %err, "failed to revert icon");
    }

    for dir in created_dirs.iter().rev() {
        if let Err(err) = fs::remove_dir(dir) {
            trace!(dir = %dir.display(), error = %err, "left icon directory in place");
        }
    }
}

/// Picks one icon per size bucket.
///
/// Within a bucket, a file whose stem matches `name` wins, then the one whose original
/// pixel size is closest to the bucket, then the first found.
pub fn select_icons(candidates: &[IconCandidate], name: &str) -> Vec<IconCandidate> {
    let name = name.to_ascii_lowercase();
    let mut buckets: BTreeMap<IconSize, &IconCandidate> = BTreeMap::new();

    let rank = |c: &IconCandidate| {
        let stem = c
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let name_match = if stem == name {
            0
        } else if stem.contains(&name) {
            1
        } else {
            2
        };
        let distance = c
            .source_px
            .map_or(0, |px| px.abs_diff(c.size.nominal()));
        (name_match, distance)
    };

    for candidate in candidates {
        match buckets.get(&candidate.size) {
            Some(current) if rank(current) <= rank(candidate) => {}
            _ => {
                buckets.insert(candidate.size, candidate);
            }
        }
    }

    buckets.into_values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::*;

    fn write_png(path: &Path, px: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::new(px, px);
        img.save(path).unwrap();
    }

    #[test]
    fn test_normalize() {
        assert_eq!(IconSize::normalize(48), IconSize::Fixed(48));
        assert_eq!(IconSize::normalize(100), IconSize::Fixed(128));
        assert_eq!(IconSize::normalize(23), IconSize::Fixed(24));
        assert_eq!(IconSize::normalize(2000), IconSize::Fixed(512));
        assert_eq!(IconSize::normalize(1), IconSize::Fixed(16));
    }

    #[test]
    fn test_size_from_path() {
        assert_eq!(
            size_from_path(Path::new("/x/icons/hicolor/256x256/apps/a.png")),
            Some(IconSize::Fixed(256))
        );
        assert_eq!(
            size_from_path(Path::new("/x/icons/scalable/apps/a.svg")),
            Some(IconSize::Scalable)
        );
        assert_eq!(size_from_path(Path::new("/x/resources/a.png")), None);
    }

    #[test]
    fn test_discover_icons() {
        let src = tempfile::tempdir().unwrap();
        write_png(&src.path().join("share/icons/hicolor/64x64/apps/app.png"), 64);
        write_png(&src.path().join("resources/icon.png"), 100);
        fs::write(src.path().join("resources/logo.svg"), "<svg/>").unwrap();
        fs::write(src.path().join("resources/readme.txt"), "x").unwrap();

        let icons = HicolorIconManager::new("/unused").discover_icons(src.path()).unwrap();
        assert_eq!(icons.len(), 3);
        assert!(icons
            .iter()
            .any(|i| i.size == IconSize::Fixed(128) && i.source_px == Some(100)));
        assert!(icons.iter().any(|i| i.size == IconSize::Scalable));
        assert!(icons.iter().any(|i| i.size == IconSize::Fixed(64)));
    }

    #[test]
    fn test_install_icon_writes_theme_and_index() {
        let src = tempfile::tempdir().unwrap();
        let icons = tempfile::tempdir().unwrap();
        let png = src.path().join("icon.png");
        write_png(&png, 48);

        let manager = HicolorIconManager::new(icons.path());
        let installed = manager.install_icon(&png, "myapp", None).unwrap();

        assert_eq!(
            installed.path,
            icons.path().join("hicolor/48x48/apps/myapp.png")
        );
        assert!(installed.path.exists());
        assert!(installed.icon_change.original.is_none());
        assert_eq!(installed.created_dirs[0], icons.path().join("hicolor"));

        let index_change = installed.index_change.unwrap();
        assert!(index_change.original.is_none());
        let index = fs::read_to_string(manager.index_path()).unwrap();
        assert!(index.contains("Directories=48x48/apps"));
        assert!(index.contains("[48x48/apps]\nSize=48"));

        // Same bucket again: index untouched.
        let again = manager.install_icon(&png, "other", None).unwrap();
        assert!(again.index_change.is_none());
        assert!(again.created_dirs.is_empty());
    }

    #[test]
    fn test_install_icon_resizes_to_bucket() {
        let src = tempfile::tempdir().unwrap();
        let icons = tempfile::tempdir().unwrap();
        let png = src.path().join("icon.png");
        write_png(&png, 100);

        let manager = HicolorIconManager::new(icons.path());
        let installed = manager.install_icon(&png, "myapp", None).unwrap();
        assert_eq!(installed.size, IconSize::Fixed(128));
        assert_eq!(image::image_dimensions(&installed.path).unwrap(), (128, 128));
    }

    #[test]
    fn test_install_svg_appends_scalable_section() {
        let src = tempfile::tempdir().unwrap();
        let icons = tempfile::tempdir().unwrap();
        let png = src.path().join("icon.png");
        let svg = src.path().join("icon.svg");
        write_png(&png, 32);
        fs::write(&svg, "<svg/>").unwrap();

        let manager = HicolorIconManager::new(icons.path());
        manager.install_icon(&png, "myapp", None).unwrap();
        let installed = manager.install_icon(&svg, "myapp", None).unwrap();

        assert_eq!(
            installed.path,
            icons.path().join("hicolor/scalable/apps/myapp.svg")
        );
        let change = installed.index_change.unwrap();
        assert!(change.original.is_some());

        let index = fs::read_to_string(manager.index_path()).unwrap();
        assert!(index.contains("Directories=32x32/apps,scalable/apps"));
        assert!(index.contains("Type=Scalable"));
    }

    #[test]
    fn test_malformed_index_reverts_icon() {
        let src = tempfile::tempdir().unwrap();
        let icons = tempfile::tempdir().unwrap();
        let png = src.path().join("icon.png");
        write_png(&png, 64);

        let manager = HicolorIconManager::new(icons.path());
        fs::create_dir_all(manager.theme_dir()).unwrap();
        fs::write(manager.index_path(), "[Icon Theme]\ngarbage\n").unwrap();

        let err = manager.install_icon(&png, "myapp", None).unwrap_err();
        assert!(matches!(err, PackageError::DesktopParse { line: 2, .. }));
        assert!(!manager.theme_dir().join("64x64").exists());

        // An icon that was already there gets its old contents back.
        let existing = manager.icon_path("myapp", IconSize::Fixed(64), "png");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, b"previous").unwrap();
        assert!(manager.install_icon(&png, "myapp", None).is_err());
        assert_eq!(fs::read(&existing).unwrap(), b"previous");
    }

    #[test]
    fn test_undecodable_png_reverts_resize() {
        let src = tempfile::tempdir().unwrap();
        let icons = tempfile::tempdir().unwrap();
        let png = src.path().join("icon.png");
        write_png(&png, 100);
        // Header stays readable, pixel data is cut off.
        let bytes = fs::read(&png).unwrap();
        fs::write(&png, &bytes[..bytes.len() - 20]).unwrap();

        let manager = HicolorIconManager::new(icons.path());
        assert!(manager.install_icon(&png, "myapp", None).is_err());
        assert!(!manager.theme_dir().exists());
        assert!(!manager.index_path().exists());
    }

    #[test]
    fn test_install_icon_rejects_unknown_extension() {
        let icons = tempfile::tempdir().unwrap();
        let manager = HicolorIconManager::new(icons.path());
        assert!(matches!(
            manager.install_icon(Path::new("/tmp/icon.bmp"), "x", None),
            Err(PackageError::UnsupportedIcon(_))
        ));
    }

    #[test]
    fn test_select_icons_prefers_name_match() {
        let candidates = vec![
            IconCandidate {
                path: PathBuf::from("/a/other.png"),
                size: IconSize::Fixed(128),
                source_px: Some(128),
            },
            IconCandidate {
                path: PathBuf::from("/a/myapp.png"),
                size: IconSize::Fixed(128),
                source_px: Some(100),
            },
            IconCandidate {
                path: PathBuf::from("/a/myapp.svg"),
                size: IconSize::Scalable,
                source_px: None,
            },
        ];

        let selected = select_icons(&candidates, "MyApp");
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].path, PathBuf::from("/a/myapp.png"));
        assert_eq!(selected[1].size, IconSize::Scalable);
    }
}
