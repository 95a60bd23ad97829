//! Desktop integration and package format inspection for upkg.
//!
//! - [`formats`]: magic-byte sniffing, including AppImage payload detection
//! - [`desktop`]: `.desktop` entry codec and `Exec=` rewriting
//! - [`icon`]: icon discovery and hicolor theme installation
//! - [`asar`]: reading icons out of Electron `asar` archives

pub mod asar;
pub mod desktop;
pub mod error;
pub mod formats;
pub mod icon;

pub use desktop::{humanize_name, DesktopEntry};
pub use error::{ErrorContext, PackageError, Result};
pub use formats::{detect_file, sniff, PackageFormat};
pub use icon::{HicolorIconManager, IconManager, IconSize};
