//! Tar (plain, gzip, bzip2, xz, zstd) and zip archives.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tracing::info;
use upkg_package::{detect_file, PackageFormat};

use super::{
    pipeline::{remove_install, InstallPipeline, InstallPlan, Materialize, Payload},
    Backend, BackendContext, BackendKind,
};
use crate::{
    error::{UpkgError, UpkgResult},
    record::{InstallOptions, InstallRecord, PackageType},
    transaction::Transaction,
};

pub struct TarballBackend {
    ctx: Arc<BackendContext>,
}

impl TarballBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Backend for TarballBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tarball
    }

    async fn detect(&self, path: &Path) -> UpkgResult<bool> {
        Ok(detect_file(path)?.is_archive())
    }

    async fn install(
        &self,
        path: &Path,
        opts: &InstallOptions,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord> {
        // A missing file is reported by the pipeline.
        let format = detect_file(path).unwrap_or(PackageFormat::Unknown);
        InstallPipeline::new(&self.ctx, opts)
            .run(path, &ArchiveMaterializer { format }, tx)
            .await
    }

    async fn uninstall(&self, record: &InstallRecord) -> UpkgResult<()> {
        remove_install(&self.ctx, record).await
    }
}

struct ArchiveMaterializer {
    format: PackageFormat,
}

#[async_trait]
impl Materialize for ArchiveMaterializer {
    fn package_type(&self, _source: &Path) -> PackageType {
        if self.format == PackageFormat::Zip {
            PackageType::Zip
        } else {
            PackageType::Tarball
        }
    }

    async fn materialize(
        &self,
        _ctx: &BackendContext,
        source: &Path,
        plan: &InstallPlan,
        _tx: &mut Transaction,
    ) -> UpkgResult<Payload> {
        info!(path = %source.display(), format = %self.format, "extracting archive");

        // Everything lands inside the install directory, which the transaction owns.
        let (archive, dest) = (source.to_path_buf(), plan.install_dir.clone());
        tokio::task::spawn_blocking(move || compak::extract_archive(&archive, &dest))
            .await
            .map_err(|e| {
                UpkgError::ExternalToolFailure {
                    command: format!("extract {}", source.display()),
                    reason: e.to_string(),
                }
            })??;

        Ok(Payload::Tree {
            root: plan.install_dir.clone(),
            entry_point: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        backend::pipeline::test_support::{context, files_below},
        runner::mock::MockCommandRunner,
    };

    /// Builds an uncompressed ustar archive from `(path, mode, contents)` entries.
    fn build_tar(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, mode, data) in entries {
            let mut header = [0u8; 512];
            header[..name.len()].copy_from_slice(name.as_bytes());
            header[100..107].copy_from_slice(format!("{mode:07o}").as_bytes());
            header[108..115].copy_from_slice(b"0000000");
            header[116..123].copy_from_slice(b"0000000");
            header[124..135].copy_from_slice(format!("{:011o}", data.len()).as_bytes());
            header[136..147].copy_from_slice(b"00000000000");
            header[156] = b'0';
            header[257..263].copy_from_slice(b"ustar\0");
            header[263..265].copy_from_slice(b"00");
            header[148..156].copy_from_slice(b"        ");
            let sum: u32 = header.iter().map(|b| *b as u32).sum();
            header[148..155].copy_from_slice(format!("{sum:06o}\0").as_bytes());

            out.extend_from_slice(&header);
            out.extend_from_slice(data);
            out.resize(out.len().div_ceil(512) * 512, 0);
        }
        out.resize(out.len() + 1024, 0);
        out
    }

    fn elf_bytes(size: usize) -> Vec<u8> {
        let mut bytes = upkg_utils::fs::ELF_MAGIC_BYTES.to_vec();
        bytes.resize(size, 0);
        bytes
    }

    #[tokio::test]
    async fn test_install_plain_tar() {
        let dir = tempfile::tempdir().unwrap();
        let main = elf_bytes(2 * 1024 * 1024);
        let helper = elf_bytes(2048);
        let tar = build_tar(&[
            ("myapp-1.0/bin/myapp", 0o755, &main),
            ("myapp-1.0/bin/myapp-crash-reporter", 0o755, &helper),
            ("myapp-1.0/README.md", 0o644, b"# myapp\n"),
        ]);
        let source = dir.path().join("myapp-1.0-linux-x64.tar");
        fs::write(&source, tar).unwrap();

        let root = dir.path().join("root");
        let backend = TarballBackend::new(Arc::new(context(&root, MockCommandRunner::new())));
        assert!(backend.detect(&source).await.unwrap());

        let mut tx = backend.ctx.transaction();
        let record = backend
            .install(&source, &InstallOptions::default(), &mut tx)
            .await
            .unwrap();
        tx.commit();

        assert_eq!(record.name, "myapp");
        assert_eq!(record.package_type, PackageType::Tarball);
        let wrapper = fs::read_to_string(root.join("bin/myapp")).unwrap();
        assert!(wrapper.contains("myapp-1.0/bin/myapp\" \"$@\""));

        backend.uninstall(&record).await.unwrap();
        assert!(files_below(&root).is_empty());
    }

    #[tokio::test]
    async fn test_archive_without_executable_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let tar = build_tar(&[("docs/guide.txt", 0o644, b"read me")]);
        let source = dir.path().join("docs.tar");
        fs::write(&source, tar).unwrap();

        let root = dir.path().join("root");
        let backend = TarballBackend::new(Arc::new(context(&root, MockCommandRunner::new())));
        let mut tx = backend.ctx.transaction();
        let err = backend
            .install(&source, &InstallOptions::default(), &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, UpkgError::NoExecutableFound(_)));

        tx.rollback().await.unwrap();
        assert!(!root.join("apps").exists());
    }

    #[test]
    fn test_zip_is_reported_as_zip() {
        let zip = ArchiveMaterializer {
            format: PackageFormat::Zip,
        };
        assert_eq!(zip.package_type(Path::new("a.zip")), PackageType::Zip);
        let tar = ArchiveMaterializer {
            format: PackageFormat::Gzip,
        };
        assert_eq!(tar.package_type(Path::new("a.tgz")), PackageType::Tarball);
    }
}
