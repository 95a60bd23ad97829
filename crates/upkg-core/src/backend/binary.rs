//! Standalone ELF executables.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tracing::debug;
use upkg_package::{detect_file, PackageFormat};
use upkg_utils::fs::make_executable;

use super::{
    pipeline::{remove_install, InstallPipeline, InstallPlan, Materialize, Payload},
    Backend, BackendContext, BackendKind,
};
use crate::{
    error::{ErrorContext, UpkgResult},
    record::{InstallOptions, InstallRecord, PackageType},
    transaction::{Step, Transaction},
};

pub struct BinaryBackend {
    ctx: Arc<BackendContext>,
}

impl BinaryBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Backend for BinaryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Binary
    }

    async fn detect(&self, path: &Path) -> UpkgResult<bool> {
        Ok(detect_file(path)? == PackageFormat::Elf)
    }

    async fn install(
        &self,
        path: &Path,
        opts: &InstallOptions,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord> {
        InstallPipeline::new(&self.ctx, opts)
            .run(path, &BinaryMaterializer, tx)
            .await
    }

    async fn uninstall(&self, record: &InstallRecord) -> UpkgResult<()> {
        remove_install(&self.ctx, record).await
    }
}

struct BinaryMaterializer;

#[async_trait]
impl Materialize for BinaryMaterializer {
    fn package_type(&self, _source: &Path) -> PackageType {
        PackageType::Binary
    }

    async fn materialize(
        &self,
        _ctx: &BackendContext,
        source: &Path,
        plan: &InstallPlan,
        tx: &mut Transaction,
    ) -> UpkgResult<Payload> {
        let dest = plan.install_dir.join(&plan.normalized);
        std::fs::copy(source, &dest)
            .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
        tx.record(Step::created_file(&dest));
        make_executable(&dest)?;
        debug!(path = %dest.display(), "copied binary");
        Ok(Payload::Executable(dest))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::*;
    use crate::{
        backend::pipeline::test_support::{context, files_below, write_elf},
        runner::mock::MockCommandRunner,
    };

    #[tokio::test]
    async fn test_install_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("ripgrep-14.1.0-x86_64");
        write_elf(&source, 4096);
        fs::set_permissions(&source, fs::Permissions::from_mode(0o644)).unwrap();

        let root = dir.path().join("root");
        let backend = BinaryBackend::new(Arc::new(context(&root, MockCommandRunner::new())));
        assert!(backend.detect(&source).await.unwrap());

        let mut tx = backend.ctx.transaction();
        let record = backend
            .install(&source, &InstallOptions::default(), &mut tx)
            .await
            .unwrap();
        tx.commit();

        let installed = root.join("apps/ripgrep/ripgrep");
        let mode = fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(record.package_type, PackageType::Binary);
        assert!(record.metadata.icon_files.is_empty());
        assert!(root.join("applications/ripgrep.desktop").exists());

        backend.uninstall(&record).await.unwrap();
        backend.uninstall(&record).await.unwrap();
        assert_eq!(files_below(&root), Vec::<std::path::PathBuf>::new());
    }

    #[tokio::test]
    async fn test_text_file_is_not_a_binary() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        fs::write(&source, "hello\n").unwrap();
        let backend = BinaryBackend::new(Arc::new(context(dir.path(), MockCommandRunner::new())));
        assert!(!backend.detect(&source).await.unwrap());
    }
}
