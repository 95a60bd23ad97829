//! Environment variables injected into generated `.desktop` launchers.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static ENV_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("unable to compile env name regex")
});

/// A single `NAME=value` pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parses `NAME=value`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, value) = raw.split_once('=').ok_or_else(|| {
            ConfigError::InvalidEnvVar {
                name: raw.to_string(),
                reason: "expected NAME=value".into(),
            }
        })?;
        let var = Self::new(name.trim(), value);
        var.validate()?;
        Ok(var)
    }

    pub fn validate(&self) -> Result<()> {
        if !ENV_NAME_RE.is_match(&self.name) {
            return Err(ConfigError::InvalidEnvVar {
                name: self.name.clone(),
                reason: "invalid variable name".into(),
            });
        }
        if self.value.contains(['\n', '\r', '\0']) {
            return Err(ConfigError::InvalidEnvVar {
                name: self.name.clone(),
                reason: "value contains a line break or NUL byte".into(),
            });
        }
        Ok(())
    }
}

/// Variables that steer common toolkits towards a native Wayland backend
/// while keeping an X11 fallback.
pub fn default_wayland_env() -> Vec<EnvVar> {
    [
        ("GDK_BACKEND", "wayland,x11"),
        ("QT_QPA_PLATFORM", "wayland;xcb"),
        ("SDL_VIDEODRIVER", "wayland,x11"),
        ("CLUTTER_BACKEND", "wayland"),
        ("MOZ_ENABLE_WAYLAND", "1"),
        ("ELECTRON_OZONE_PLATFORM_HINT", "auto"),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar::new(name, value))
    .collect()
}
