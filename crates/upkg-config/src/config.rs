use std::{
    fs,
    path::PathBuf,
    sync::{LazyLock, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use upkg_utils::path::{
    applications_dir, icons_dir, resolve_path, user_bin_dir, xdg_config_home, xdg_data_home,
};

use crate::{
    env::{default_wayland_env, EnvVar},
    error::{ConfigError, Result},
};

/// Application's configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Root directory for upkg managed state.
    /// Default: $XDG_DATA_HOME/upkg
    pub root_path: Option<String>,

    /// Directory that holds one subdirectory per extracted package.
    /// Default: $UPKG_ROOT/apps
    pub install_path: Option<String>,

    /// Directory where wrapper scripts are placed.
    /// Default: ~/.local/bin
    pub bin_path: Option<String>,

    /// Directory for generated `.desktop` entries.
    /// Default: $XDG_DATA_HOME/applications
    pub applications_path: Option<String>,

    /// Root of the icon themes; icons land in `hicolor` below it.
    /// Default: $XDG_DATA_HOME/icons
    pub icons_path: Option<String>,

    /// Path to the SQLite install database.
    /// Default: $UPKG_ROOT/upkg.db
    pub db_path: Option<String>,

    /// Wayland compatibility variables prefixed to every generated `Exec=` line.
    pub wayland_env: Option<Vec<EnvVar>>,

    /// Extra user variables, appended after the Wayland defaults.
    pub custom_env: Option<Vec<EnvVar>>,

    /// Appends `--no-sandbox` to Electron wrappers.
    /// Default: false
    pub electron_disable_sandbox: Option<bool>,

    /// Runs `update-desktop-database` and `gtk-update-icon-cache` after changes.
    /// Default: true
    pub refresh_caches: Option<bool>,
}

pub static CONFIG: LazyLock<RwLock<Option<Config>>> = LazyLock::new(|| RwLock::new(None));

pub static CONFIG_PATH: LazyLock<RwLock<PathBuf>> = LazyLock::new(|| {
    RwLock::new(match std::env::var("UPKG_CONFIG") {
        Ok(path_str) => PathBuf::from(path_str),
        Err(_) => xdg_config_home().join("upkg").join("config.toml"),
    })
});

/// Points the global config at a different file. Must run before [`init`].
pub fn set_config_path(path: PathBuf) {
    let mut guard = CONFIG_PATH.write().unwrap_or_else(|e| e.into_inner());
    *guard = path;
}

pub fn config_path() -> PathBuf {
    CONFIG_PATH
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .to_path_buf()
}

pub fn init() -> Result<()> {
    let config = Config::new()?;
    let mut global_config = CONFIG.write().unwrap_or_else(|e| e.into_inner());
    *global_config = Some(config);
    Ok(())
}

pub fn get_config() -> Config {
    {
        let guard = CONFIG.read().unwrap_or_else(|e| e.into_inner());
        if let Some(config) = guard.as_ref() {
            return config.clone();
        }
    }

    let mut guard = CONFIG.write().unwrap_or_else(|e| e.into_inner());
    guard.get_or_insert_with(Config::default_config).clone()
}

fn default_root() -> String {
    std::env::var("UPKG_ROOT")
        .unwrap_or_else(|_| format!("{}/upkg", xdg_data_home().display()))
}

impl Config {
    pub fn default_config() -> Self {
        let root = default_root();

        Self {
            root_path: Some(root.clone()),
            install_path: Some(format!("{root}/apps")),
            bin_path: Some(user_bin_dir().display().to_string()),
            applications_path: Some(applications_dir().display().to_string()),
            icons_path: Some(icons_dir().display().to_string()),
            db_path: Some(format!("{root}/upkg.db")),
            wayland_env: Some(default_wayland_env()),
            custom_env: Some(Vec::new()),
            electron_disable_sandbox: Some(false),
            refresh_caches: Some(true),
        }
    }

    /// Creates a new configuration by loading it from the configuration file.
    /// If the configuration file is not found, it uses the default configuration.
    pub fn new() -> Result<Self> {
        let config_path = config_path();

        let mut config = match fs::read_to_string(&config_path) {
            Ok(content) => {
                debug!(path = %config_path.display(), "loading configuration");
                toml::from_str(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default_config(),
            Err(err) => return Err(ConfigError::IoError(err)),
        };

        config.resolve()?;

        Ok(config)
    }

    /// Fills unset fields with defaults and validates user supplied variables.
    pub fn resolve(&mut self) -> Result<()> {
        if self.wayland_env.is_none() {
            self.wayland_env = Some(default_wayland_env());
        }
        self.custom_env.get_or_insert_with(Vec::new);
        self.electron_disable_sandbox.get_or_insert(false);
        self.refresh_caches.get_or_insert(true);

        for var in self
            .wayland_env
            .iter()
            .flatten()
            .chain(self.custom_env.iter().flatten())
        {
            var.validate()?;
        }

        Ok(())
    }

    pub fn get_root_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("UPKG_ROOT") {
            return Ok(resolve_path(&env_path)?);
        }
        match &self.root_path {
            Some(root) => Ok(resolve_path(root)?),
            None => Ok(xdg_data_home().join("upkg")),
        }
    }

    pub fn get_install_path(&self) -> Result<PathBuf> {
        if std::env::var("UPKG_ROOT").is_ok() {
            return Ok(self.get_root_path()?.join("apps"));
        }
        match &self.install_path {
            Some(path) => Ok(resolve_path(path)?),
            None => Ok(self.get_root_path()?.join("apps")),
        }
    }

    pub fn get_bin_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("UPKG_BIN") {
            return Ok(resolve_path(&env_path)?);
        }
        match &self.bin_path {
            Some(path) => Ok(resolve_path(path)?),
            None => Ok(user_bin_dir()),
        }
    }

    pub fn get_applications_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("UPKG_APPLICATIONS") {
            return Ok(resolve_path(&env_path)?);
        }
        match &self.applications_path {
            Some(path) => Ok(resolve_path(path)?),
            None => Ok(applications_dir()),
        }
    }

    pub fn get_icons_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("UPKG_ICONS") {
            return Ok(resolve_path(&env_path)?);
        }
        match &self.icons_path {
            Some(path) => Ok(resolve_path(path)?),
            None => Ok(icons_dir()),
        }
    }

    pub fn get_db_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("UPKG_DB") {
            return Ok(resolve_path(&env_path)?);
        }
        if std::env::var("UPKG_ROOT").is_ok() {
            return Ok(self.get_root_path()?.join("upkg.db"));
        }
        match &self.db_path {
            Some(path) => Ok(resolve_path(path)?),
            None => Ok(self.get_root_path()?.join("upkg.db")),
        }
    }

    /// Wayland defaults followed by the user's custom variables.
    pub fn launcher_env(&self) -> Vec<EnvVar> {
        let mut vars = self
            .wayland_env
            .clone()
            .unwrap_or_else(default_wayland_env);
        vars.extend(self.custom_env.iter().flatten().cloned());
        vars
    }

    pub fn electron_disable_sandbox(&self) -> bool {
        self.electron_disable_sandbox.unwrap_or(false)
    }

    pub fn refresh_caches(&self) -> bool {
        self.refresh_caches.unwrap_or(true)
    }
}

pub fn generate_default_config() -> Result<PathBuf> {
    let config_path = config_path();

    if config_path.exists() {
        return Err(ConfigError::ConfigAlreadyExists);
    }

    let serialized = toml::to_string_pretty(&Config::default_config())?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, serialized)?;
    info!(
        "Default configuration file generated at: {}",
        config_path.display()
    );
    Ok(config_path)
}
