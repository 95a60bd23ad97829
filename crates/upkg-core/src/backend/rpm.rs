//! RPM packages.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use upkg_package::{detect_file, PackageFormat};

use super::{
    pipeline::{remove_install, InstallPipeline, InstallPlan, Materialize, PackageInfo, Payload},
    system, Backend, BackendContext, BackendKind,
};
use crate::{
    error::{UpkgError, UpkgResult},
    record::{InstallOptions, InstallRecord, PackageType},
    runner::{CommandSpec, EXTRACT_TIMEOUT, METADATA_TIMEOUT},
    transaction::Transaction,
};

/// What to install when no RPM toolchain is present.
const RPM_TOOLCHAINS: &str =
    "bsdtar (libarchive), rpm2cpio and cpio, or alien with debtap and pacman";

pub struct RpmBackend {
    ctx: Arc<BackendContext>,
}

impl RpmBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Backend for RpmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rpm
    }

    async fn detect(&self, path: &Path) -> UpkgResult<bool> {
        Ok(detect_file(path)? == PackageFormat::Rpm)
    }

    async fn install(
        &self,
        path: &Path,
        opts: &InstallOptions,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord> {
        InstallPipeline::new(&self.ctx, opts)
            .run(path, &RpmMaterializer { opts }, tx)
            .await
    }

    async fn uninstall(&self, record: &InstallRecord) -> UpkgResult<()> {
        remove_install(&self.ctx, record).await
    }
}

struct RpmMaterializer<'a> {
    opts: &'a InstallOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extractor {
    Bsdtar,
    Rpm2Cpio,
}

impl Extractor {
    fn available(ctx: &BackendContext) -> Option<Self> {
        let runner = &ctx.runner;
        if runner.exists("bsdtar") {
            Some(Self::Bsdtar)
        } else if runner.exists("rpm2cpio") && runner.exists("cpio") {
            Some(Self::Rpm2Cpio)
        } else {
            None
        }
    }

    fn command(self, rpm: &Path, dest: &Path) -> CommandSpec {
        let rpm = rpm.to_string_lossy();
        let spec = match self {
            Self::Bsdtar => {
                CommandSpec::new("bsdtar")
                    .arg("-xf")
                    .arg(rpm)
                    .arg("-C")
                    .arg(dest.to_string_lossy())
            }
            Self::Rpm2Cpio => {
                CommandSpec::new("sh")
                    .arg("-c")
                    .arg(r#"rpm2cpio "$1" | cpio -idmu --quiet"#)
                    .arg("sh")
                    .arg(rpm)
                    .current_dir(dest)
            }
        };
        spec.timeout(EXTRACT_TIMEOUT)
    }
}

#[async_trait]
impl Materialize for RpmMaterializer<'_> {
    fn package_type(&self, _source: &Path) -> PackageType {
        PackageType::Rpm
    }

    async fn query_metadata(&self, ctx: &BackendContext, source: &Path) -> PackageInfo {
        if !ctx.runner.exists("rpm") {
            return PackageInfo::default();
        }

        let spec = CommandSpec::new("rpm")
            .args(["-qp", "--queryformat", "%{NAME}\\n%{VERSION}-%{RELEASE}\\n"])
            .arg(source.to_string_lossy())
            .timeout(METADATA_TIMEOUT);
        match ctx.runner.run_checked(&spec).await {
            Ok(output) => {
                let mut lines = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty());
                PackageInfo {
                    name: lines.next().map(String::from),
                    version: lines.next().map(String::from),
                }
            }
            Err(err) => {
                debug!(error = %err, "rpm metadata query failed");
                PackageInfo::default()
            }
        }
    }

    async fn materialize(
        &self,
        ctx: &BackendContext,
        source: &Path,
        plan: &InstallPlan,
        tx: &mut Transaction,
    ) -> UpkgResult<Payload> {
        let system_path = ctx.runner.exists("alien") && system::deb_system_path_available(ctx);

        if let Some(extractor) = Extractor::available(ctx) {
            info!(path = %source.display(), ?extractor, "extracting package");
            match ctx.runner.run_checked(&extractor.command(source, &plan.install_dir)).await {
                Ok(_) => {
                    return Ok(Payload::Tree {
                        root: plan.install_dir.clone(),
                        entry_point: None,
                    });
                }
                Err(err) if system_path => {
                    warn!(error = %err, "direct extraction failed, converting with alien");
                }
                Err(err) => return Err(err),
            }
        }

        if !system_path {
            return Err(UpkgError::NoInstallationMethod {
                package: source.display().to_string(),
                tools: RPM_TOOLCHAINS.into(),
            });
        }

        let deb = system::convert_rpm_to_deb(ctx, source, &plan.install_dir, tx).await?;
        let package = system::install_deb(ctx, &deb, &plan.install_dir, self.opts, tx).await?;
        Ok(Payload::SystemManaged { package })
    }
}
