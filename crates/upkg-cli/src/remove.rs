use nu_ansi_term::Color::{Blue, Cyan, LightRed};
use tracing::{debug, error, info, warn};
use upkg_core::{PackageManager, UpkgError, UpkgResult};

use crate::utils::Colored;

/// Uninstalls each package in turn. Failures are reported and the loop
/// continues; the first failure is returned at the end.
pub async fn remove_packages(
    pm: &PackageManager,
    packages: &[String],
    all: bool,
) -> UpkgResult<()> {
    debug!(count = packages.len(), all = all, "starting package removal");

    if all {
        let results = pm.uninstall_all().await?;
        if results.is_empty() {
            info!("No packages installed");
            return Ok(());
        }
        let mut failed = 0;
        for (record, result) in results {
            match result {
                Ok(()) => {
                    info!(
                        "Removed {} ({})",
                        Colored(Blue, &record.name),
                        Colored(LightRed, &record.version)
                    );
                }
                Err(err) => {
                    failed += 1;
                    error!("Failed to remove {}: {err}", record.name);
                }
            }
        }
        if failed > 0 {
            return Err(UpkgError::InvalidInput(format!(
                "{failed} package(s) could not be removed"
            )));
        }
        return Ok(());
    }

    let mut first_error = None;
    for package in packages {
        match pm.uninstall(package).await {
            Ok(record) => {
                info!(
                    "Removed {} ({}) [{}]",
                    Colored(Blue, &record.name),
                    Colored(LightRed, &record.version),
                    Colored(Cyan, &record.install_id)
                );
            }
            Err(UpkgError::NotFound(_)) => {
                warn!("Package {} is not installed.", package);
                first_error.get_or_insert(UpkgError::NotFound(format!("Package '{package}'")));
            }
            Err(err) => {
                error!("Failed to remove {}: {err}", package);
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
