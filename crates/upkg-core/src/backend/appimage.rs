//! AppImage bundles: an ELF runtime with a squashfs image appended.

use std::{fs::File, path::Path, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use upkg_package::{detect_file, formats::elf_payload_offset, PackageFormat};
use upkg_utils::fs::make_executable;

use super::{
    pipeline::{
        discard_scratch, remove_install, InstallPipeline, InstallPlan, Materialize, Payload,
    },
    Backend, BackendContext, BackendKind,
};
use crate::{
    error::{ErrorContext, UpkgResult},
    record::{InstallOptions, InstallRecord, PackageType},
    runner::{CommandSpec, EXTRACT_TIMEOUT},
    transaction::{Step, Transaction},
};

const EXTRACT_DIR: &str = "squashfs-root";

pub struct AppImageBackend {
    ctx: Arc<BackendContext>,
}

impl AppImageBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Backend for AppImageBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AppImage
    }

    async fn detect(&self, path: &Path) -> UpkgResult<bool> {
        Ok(detect_file(path)? == PackageFormat::AppImage)
    }

    async fn install(
        &self,
        path: &Path,
        opts: &InstallOptions,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord> {
        InstallPipeline::new(&self.ctx, opts)
            .run(path, &AppImageMaterializer, tx)
            .await
    }

    async fn uninstall(&self, record: &InstallRecord) -> UpkgResult<()> {
        remove_install(&self.ctx, record).await
    }
}

struct AppImageMaterializer;

impl AppImageMaterializer {
    async fn unsquashfs(
        &self,
        ctx: &BackendContext,
        source: &Path,
        dest: &Path,
    ) -> UpkgResult<bool> {
        if !ctx.runner.exists("unsquashfs") {
            return Ok(false);
        }
        let mut file = File::open(source).with_context(|| format!("opening {}", source.display()))?;
        let Some(offset) = elf_payload_offset(&mut file)? else {
            return Ok(false);
        };

        let spec = CommandSpec::new("unsquashfs")
            .args(["-f", "-o"])
            .arg(offset.to_string())
            .arg("-d")
            .arg(dest.to_string_lossy())
            .arg(source.to_string_lossy())
            .timeout(EXTRACT_TIMEOUT);
        info!(path = %source.display(), offset, "extracting with unsquashfs");
        match ctx.runner.run_checked(&spec).await {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(error = %err, "unsquashfs failed");
                Ok(false)
            }
        }
    }

    /// Runs the AppImage's own `--appimage-extract` on a private copy.
    async fn self_extract(
        &self,
        ctx: &BackendContext,
        copy: &Path,
        install_dir: &Path,
    ) -> UpkgResult<bool> {
        let spec = CommandSpec::new(copy.to_string_lossy())
            .arg("--appimage-extract")
            .current_dir(install_dir)
            .timeout(EXTRACT_TIMEOUT);
        info!(path = %copy.display(), "extracting with --appimage-extract");
        match ctx.runner.run_checked(&spec).await {
            Ok(_) => Ok(install_dir.join(EXTRACT_DIR).is_dir()),
            Err(err) => {
                warn!(error = %err, "--appimage-extract failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Materialize for AppImageMaterializer {
    fn package_type(&self, _source: &Path) -> PackageType {
        PackageType::AppImage
    }

    async fn materialize(
        &self,
        ctx: &BackendContext,
        source: &Path,
        plan: &InstallPlan,
        tx: &mut Transaction,
    ) -> UpkgResult<Payload> {
        let root = plan.install_dir.join(EXTRACT_DIR);

        let extracted = self.unsquashfs(ctx, source, &root).await?;
        let copy = plan.install_dir.join(format!("{}.AppImage", plan.normalized));
        if !extracted {
            std::fs::copy(source, &copy)
                .with_context(|| format!("copying {} to {}", source.display(), copy.display()))?;
            tx.record(Step::created_file(&copy));
            make_executable(&copy)?;

            if !self.self_extract(ctx, &copy, &plan.install_dir).await? {
                // Run the bundle as is; it mounts itself through FUSE.
                warn!(pkg_name = %plan.name, "could not extract AppImage, running it packed");
                return Ok(Payload::Executable(copy));
            }
            discard_scratch(ctx, &copy);
        }

        let app_run = root.join("AppRun");
        debug!(root = %root.display(), "AppImage extracted");
        Ok(Payload::Tree {
            entry_point: app_run.exists().then_some(app_run),
            root,
        })
    }
}
