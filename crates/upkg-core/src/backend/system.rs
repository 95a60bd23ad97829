//! Installs through the system package manager: `debtap` converts a `.deb`
//! into a pacman package which `pacman -U` then installs.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use upkg_utils::system::is_root;

use super::BackendContext;
use crate::{
    error::{ErrorContext, UpkgError, UpkgResult},
    record::InstallOptions,
    runner::{CommandSpec, EXTRACT_TIMEOUT, METADATA_TIMEOUT, SYSTEM_INSTALL_TIMEOUT},
    transaction::{Step, Transaction},
};

/// Tools the DEB system path needs.
pub const DEB_SYSTEM_TOOLS: [&str; 2] = ["debtap", "pacman"];

pub fn deb_system_path_available(ctx: &BackendContext) -> bool {
    DEB_SYSTEM_TOOLS.iter().all(|tool| ctx.runner.exists(tool))
}

/// `pacman` with `args`, through `sudo` when not running as root.
fn pacman<I, S>(ctx: &BackendContext, args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    if !is_root() && ctx.runner.exists("sudo") {
        CommandSpec::new("sudo").arg("pacman").args(args)
    } else {
        CommandSpec::new("pacman").args(args)
    }
}

/// Converts `deb` with debtap inside `work_dir` and installs the result with
/// pacman. Returns the pacman package name.
///
/// `work_dir` must already be owned by `tx`. The pacman install is recorded
/// with a `pacman -R` compensation, unless the package was already present.
pub async fn install_deb(
    ctx: &BackendContext,
    deb: &Path,
    work_dir: &Path,
    opts: &InstallOptions,
    tx: &mut Transaction,
) -> UpkgResult<String> {
    if !deb_system_path_available(ctx) {
        return Err(UpkgError::NoInstallationMethod {
            package: deb.display().to_string(),
            tools: DEB_SYSTEM_TOOLS.join(", "),
        });
    }

    // debtap writes its output next to the input, so work on a copy.
    let file_name = deb
        .file_name()
        .ok_or_else(|| UpkgError::InvalidInput(format!("{} has no file name", deb.display())))?;
    let local_deb = work_dir.join(file_name);
    if local_deb != deb {
        std::fs::copy(deb, &local_deb)
            .with_context(|| format!("copying {} to {}", deb.display(), work_dir.display()))?;
        tx.record(Step::created_file(&local_deb));
    }

    info!(path = %deb.display(), "converting package with debtap");
    let convert = CommandSpec::new("debtap")
        .arg("-Q")
        .arg(local_deb.to_string_lossy())
        .current_dir(work_dir)
        .timeout(SYSTEM_INSTALL_TIMEOUT);
    ctx.runner.run_checked(&convert).await?;

    let converted = find_pacman_package(work_dir)?.ok_or_else(|| {
        UpkgError::ExternalToolFailure {
            command: convert.to_string(),
            reason: "no pacman package was produced".into(),
        }
    })?;
    tx.record(Step::created_file(&converted));

    let package = query_package_name(ctx, &converted).await?;
    let already_present = is_installed(ctx, &package).await;
    if already_present && !opts.force {
        return Err(UpkgError::AlreadyInstalled(package));
    }

    let mut args = vec!["-U".to_string(), "--noconfirm".to_string()];
    if opts.overwrite {
        args.push("--overwrite".into());
        args.push("*".into());
    }
    args.push(converted.to_string_lossy().into_owned());
    let install = pacman(ctx, args).timeout(SYSTEM_INSTALL_TIMEOUT);

    info!(pkg_name = %package, "installing with pacman");
    ctx.runner.run_checked(&install).await?;

    // Removing a package that was there before would lose the user's install.
    let compensation = (!already_present).then(|| {
        pacman(ctx, ["-R", "--noconfirm", package.as_str()]).timeout(SYSTEM_INSTALL_TIMEOUT)
    });
    tx.record(Step::ran_command(install, compensation));

    Ok(package)
}

/// Removes a pacman-managed package. A package that is already gone counts as removed.
pub async fn remove_package(ctx: &BackendContext, package: &str) -> UpkgResult<()> {
    let spec = pacman(ctx, ["-R", "--noconfirm", package]).timeout(SYSTEM_INSTALL_TIMEOUT);
    let output = ctx.runner.run(&spec).await?;
    if output.success() {
        info!(pkg_name = %package, "removed with pacman");
        return Ok(());
    }
    if output.stderr.contains("target not found") {
        warn!(pkg_name = %package, "package was not installed");
        return Ok(());
    }

    Err(UpkgError::ExternalToolFailure {
        command: spec.to_string(),
        reason: match output.status {
            Some(code) => format!("exited with status {code}: {}", output.stderr.trim()),
            None => format!("terminated by signal: {}", output.stderr.trim()),
        },
    })
}

fn find_pacman_package(dir: &Path) -> UpkgResult<Option<PathBuf>> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            name.contains(".pkg.tar")
        })
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

async fn query_package_name(ctx: &BackendContext, pkg: &Path) -> UpkgResult<String> {
    let spec = CommandSpec::new("pacman")
        .arg("-Qp")
        .arg(pkg.to_string_lossy())
        .timeout(METADATA_TIMEOUT);
    let output = ctx.runner.run_checked(&spec).await?;
    output
        .stdout
        .split_whitespace()
        .next()
        .map(String::from)
        .ok_or_else(|| {
            UpkgError::ExternalToolFailure {
                command: spec.to_string(),
                reason: "empty package name".into(),
            }
        })
}

async fn is_installed(ctx: &BackendContext, package: &str) -> bool {
    let spec = CommandSpec::new("pacman")
        .args(["-Q", package])
        .timeout(METADATA_TIMEOUT);
    match ctx.runner.run(&spec).await {
        Ok(output) => output.success(),
        Err(err) => {
            debug!(pkg_name = %package, error = %err, "pacman query failed");
            false
        }
    }
}

/// `alien` converts an RPM into a `.deb` inside `work_dir`.
pub async fn convert_rpm_to_deb(
    ctx: &BackendContext,
    rpm: &Path,
    work_dir: &Path,
    tx: &mut Transaction,
) -> UpkgResult<PathBuf> {
    let spec = CommandSpec::new("alien")
        .args(["--to-deb", "--scripts"])
        .arg(rpm.to_string_lossy())
        .current_dir(work_dir)
        .timeout(EXTRACT_TIMEOUT);
    info!(path = %rpm.display(), "converting package with alien");
    ctx.runner.run_checked(&spec).await?;

    let entries =
        std::fs::read_dir(work_dir).with_context(|| format!("reading {}", work_dir.display()))?;
    let mut debs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "deb"))
        .collect();
    debs.sort();
    let deb = debs.into_iter().next().ok_or_else(|| {
        UpkgError::ExternalToolFailure {
            command: spec.to_string(),
            reason: "no .deb was produced".into(),
        }
    })?;
    tx.record(Step::created_file(&deb));
    Ok(deb)
}
