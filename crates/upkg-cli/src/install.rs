use nu_ansi_term::Color::{Blue, Cyan, LightRed, Magenta};
use tracing::{debug, info};
use upkg_core::{record::InstallOptions, PackageManager, UpkgResult};
use upkg_utils::path::resolve_path;

use crate::utils::Colored;

pub async fn install_package(
    pm: &PackageManager,
    file: &str,
    opts: InstallOptions,
) -> UpkgResult<()> {
    let path = resolve_path(file)?;
    debug!(path = %path.display(), force = opts.force, "starting install");

    let record = pm.install(&path, &opts).await?;

    info!(
        pkg_name = %record.name,
        install_id = %record.install_id,
        package_type = %record.package_type,
        version = %record.version,
        "Installed {} ({}) as {}",
        Colored(Blue, &record.name),
        Colored(LightRed, &record.version),
        Colored(Magenta, &record.package_type)
    );
    if let Some(wrapper) = &record.metadata.wrapper_script {
        info!("  Launcher: {}", Colored(Cyan, wrapper.display()));
    }
    if let Some(package) = &record.metadata.system_package {
        info!("  Managed by pacman as {}", Colored(Cyan, package));
    }
    Ok(())
}
