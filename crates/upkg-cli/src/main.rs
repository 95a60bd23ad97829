use std::fs;

use clap::Parser;
use cli::{Args, Commands};
use install::install_package;
use list::{list_backends, list_installed_packages, package_info};
use logging::setup_logging;
use remove::remove_packages;
use tracing::{info, warn};
use upkg_config::{
    config::{self, config_path, generate_default_config, get_config, set_config_path, Config},
    error::ConfigError,
};
use upkg_core::{record::InstallOptions, PackageManager, UpkgError, UpkgResult};
use upkg_utils::path::resolve_path;

mod cli;
mod install;
mod list;
mod logging;
mod remove;
mod utils;

fn print_config() -> UpkgResult<()> {
    let path = config_path();
    let content = match fs::read_to_string(&path) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config file {} not found", path.display());
            toml::to_string_pretty(&Config::default_config()).map_err(ConfigError::from)?
        }
        Err(err) => {
            return Err(UpkgError::IoError {
                action: "reading config".to_string(),
                source: err,
            });
        }
    };
    info!("{}", content);
    Ok(())
}

async fn handle_cli() -> UpkgResult<()> {
    let args = Args::parse();

    setup_logging(&args);

    if args.no_color {
        utils::disable_color();
    }

    if let Some(ref c) = args.config {
        set_config_path(resolve_path(c)?);
    }

    match args.command {
        Commands::DefConfig => {
            generate_default_config()?;
        }
        Commands::Config => print_config()?,
        command => {
            config::init()?;
            let pm = PackageManager::from_config(&get_config())?;

            match command {
                Commands::Install {
                    file,
                    force,
                    skip_desktop,
                    name,
                    skip_wayland_env,
                    overwrite,
                } => {
                    let opts = InstallOptions {
                        force,
                        skip_desktop,
                        custom_name: name,
                        skip_wayland_env,
                        overwrite,
                    };
                    install_package(&pm, &file, opts).await?;
                }
                Commands::Uninstall {
                    packages,
                    all,
                } => {
                    remove_packages(&pm, &packages, all).await?;
                }
                Commands::List {
                    package_type,
                } => {
                    list_installed_packages(&pm, package_type.as_deref())?;
                }
                Commands::Info {
                    package,
                } => {
                    package_info(&pm, &package)?;
                }
                Commands::Backends => list_backends(&pm),
                Commands::Config | Commands::DefConfig => unreachable!(),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    if let Err(err) = handle_cli().await {
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(1);
    }
}
