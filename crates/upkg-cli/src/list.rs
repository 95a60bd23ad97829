use std::path::Path;

use nu_ansi_term::Color::{Blue, Cyan, Green, LightRed, Magenta, Yellow};
use tabled::{
    builder::Builder,
    settings::{themes::BorderCorrection, Panel, Style},
};
use tracing::{debug, info};
use upkg_core::{
    record::{InstallRecord, PackageType},
    PackageManager, UpkgResult,
};

use crate::utils::{Colored, Icons};

pub fn list_installed_packages(
    pm: &PackageManager,
    package_type: Option<&str>,
) -> UpkgResult<()> {
    let package_type = package_type.map(str::parse::<PackageType>).transpose()?;
    debug!(package_type = ?package_type, "listing installed packages");

    let records = pm.list(package_type)?;
    if records.is_empty() {
        info!("No packages installed");
        return Ok(());
    }

    let mut builder = Builder::new();
    builder.push_record(["Name", "Version", "Type", "Installed", "ID"]);
    for record in &records {
        builder.push_record([
            Colored(Blue, &record.name).to_string(),
            Colored(LightRed, &record.version).to_string(),
            Colored(Magenta, record.package_type).to_string(),
            record.install_date.format("%Y-%m-%d %H:%M").to_string(),
            Colored(Cyan, &record.install_id).to_string(),
        ]);
    }

    let table = builder
        .build()
        .with(Panel::footer(format!("{} installed", records.len())))
        .with(Style::rounded())
        .with(BorderCorrection {})
        .to_string();
    info!("\n{table}");
    Ok(())
}

fn display_path(path: &Path) -> String {
    Colored(Green, path.display()).to_string()
}

fn info_table(record: &InstallRecord) -> String {
    let mut builder = Builder::new();
    builder.push_record([
        format!("{} Name", Icons::PACKAGE),
        Colored(Blue, &record.name).to_string(),
    ]);
    builder.push_record([
        format!("{} Version", Icons::VERSION),
        Colored(LightRed, &record.version).to_string(),
    ]);
    builder.push_record([
        format!("{} Type", Icons::TYPE),
        format!(
            "{} ({})",
            Colored(Magenta, record.package_type),
            record.metadata.install_method
        ),
    ]);
    builder.push_record([
        format!("{} Install ID", Icons::ID),
        Colored(Cyan, &record.install_id).to_string(),
    ]);
    builder.push_record([
        format!("{} Installed", Icons::CALENDAR),
        record.install_date.to_rfc3339(),
    ]);
    builder.push_record([
        format!("{} Source", Icons::FILE),
        display_path(&record.original_file),
    ]);

    if !record.install_path.as_os_str().is_empty() {
        builder.push_record([
            format!("{} Location", Icons::FOLDER),
            display_path(&record.install_path),
        ]);
    }
    if let Some(package) = &record.metadata.system_package {
        builder.push_record([
            format!("{} System package", Icons::PACKAGE),
            Colored(Yellow, package).to_string(),
        ]);
    }
    if let Some(wrapper) = &record.metadata.wrapper_script {
        builder.push_record([format!("{} Launcher", Icons::SCRIPT), display_path(wrapper)]);
    }

    let desktop_files: Vec<String> = record
        .desktop_file
        .iter()
        .chain(&record.metadata.desktop_files)
        .map(|p| p.display().to_string())
        .fold(Vec::new(), |mut acc, p| {
            if !acc.contains(&p) {
                acc.push(p);
            }
            acc
        });
    if !desktop_files.is_empty() {
        builder.push_record([format!("{} Desktop", Icons::DESKTOP), desktop_files.join("\n")]);
    }
    if !record.metadata.icon_files.is_empty() {
        builder.push_record([
            format!("{} Icons", Icons::IMAGE),
            record
                .metadata
                .icon_files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        ]);
    }
    builder.push_record([
        format!("{} Wayland", Icons::WAYLAND),
        record.metadata.wayland_support.to_string(),
    ]);

    builder
        .build()
        .with(Panel::header("Package Info"))
        .with(Style::rounded())
        .with(BorderCorrection {})
        .to_string()
}

pub fn package_info(pm: &PackageManager, package: &str) -> UpkgResult<()> {
    let record = pm.find(package)?;
    info!(
        pkg_name = %record.name,
        install_id = %record.install_id,
        "\n{}",
        info_table(&record)
    );
    Ok(())
}

pub fn list_backends(pm: &PackageManager) {
    let mut builder = Builder::new();
    builder.push_record(["Priority", "Backend", "Handles"]);
    for (idx, kind) in pm.registry().list_backends().into_iter().enumerate() {
        builder.push_record([
            (idx + 1).to_string(),
            Colored(Blue, kind).to_string(),
            kind.description().to_string(),
        ]);
    }

    let table = builder
        .build()
        .with(Style::rounded())
        .with(BorderCorrection {})
        .to_string();
    info!("\n{table}");
}
