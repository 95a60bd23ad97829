//! Backend lookup and format detection.

use std::{path::Path, sync::Arc};

use tracing::{debug, trace, warn};
use upkg_package::{formats::SNIFF_LEN, sniff};
use upkg_utils::fs::read_file_signature;

use crate::{
    backend::{Backend, BackendContext, BackendKind},
    error::{UpkgError, UpkgResult},
};

/// The backends in detection order.
pub struct Registry {
    backends: Vec<Box<dyn Backend>>,
}

impl Registry {
    /// Every backend, in [`BackendKind::PRIORITY`] order.
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        let backends = BackendKind::PRIORITY
            .into_iter()
            .map(|kind| kind.build(ctx.clone()))
            .collect();
        Self { backends }
    }

    /// Uses `backends` as given; detection tries them in order.
    pub fn with_backends(backends: Vec<Box<dyn Backend>>) -> Self {
        Self { backends }
    }

    /// First backend that accepts `path`.
    ///
    /// A backend whose detection fails is logged and skipped. When nothing
    /// matches, the error describes what the file looks like.
    pub async fn detect_backend(&self, path: &Path) -> UpkgResult<&dyn Backend> {
        if !path.exists() {
            return Err(UpkgError::NotFound(format!("Package file {}", path.display())));
        }
        if !path.is_file() {
            return Err(UpkgError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        for backend in &self.backends {
            match backend.detect(path).await {
                Ok(true) => {
                    debug!(
                        backend = backend.name(),
                        path = %path.display(),
                        "detected package format"
                    );
                    return Ok(backend.as_ref());
                }
                Ok(false) => trace!(backend = backend.name(), "not matched"),
                Err(err) => {
                    warn!(
                        backend = backend.name(),
                        error = %err,
                        "detection failed, trying next backend"
                    );
                }
            }
        }

        let signature = read_file_signature(path, SNIFF_LEN)?;
        let format = sniff(&signature);
        Err(UpkgError::UnsupportedFormat {
            path: path.to_path_buf(),
            detected: format.to_string(),
            hint: format.hint().map(String::from),
        })
    }

    pub fn get_backend(&self, name: &str) -> UpkgResult<&dyn Backend> {
        let kind = BackendKind::from_name(name)
            .ok_or_else(|| UpkgError::NotFound(format!("Backend '{name}'")))?;
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .map(|b| b.as_ref())
            .ok_or_else(|| UpkgError::NotFound(format!("Backend '{name}'")))
    }

    pub fn list_backends(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        backend::pipeline::test_support::{context, write_elf},
        record::{InstallOptions, InstallRecord},
        runner::mock::MockCommandRunner,
        transaction::Transaction,
    };

    fn registry(dir: &Path) -> Registry {
        Registry::new(Arc::new(context(dir, MockCommandRunner::new())))
    }

    fn write_appimage(path: &Path) {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        bytes[4] = 2;
        bytes[5] = 1;
        bytes[0x28..0x30].copy_from_slice(&64u64.to_le_bytes());
        bytes.extend_from_slice(b"hsqs");
        fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_detects_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let mut deb = b"!<arch>\ndebian-binary   ".to_vec();
        deb.resize(128, b' ');
        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");

        let cases: Vec<(&str, Vec<u8>, BackendKind)> = vec![
            ("a.deb", deb, BackendKind::Deb),
            ("a.rpm", vec![0xed, 0xab, 0xee, 0xdb, 3, 0], BackendKind::Rpm),
            ("a.zip", vec![0x50, 0x4b, 0x03, 0x04, 0, 0], BackendKind::Tarball),
            ("a.tar.gz", vec![0x1f, 0x8b, 8, 0], BackendKind::Tarball),
            ("a.tar.bz2", b"BZh91AY".to_vec(), BackendKind::Tarball),
            ("a.tar.xz", vec![0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0], BackendKind::Tarball),
            ("a.tar.zst", vec![0x28, 0xb5, 0x2f, 0xfd, 0], BackendKind::Tarball),
            ("a.tar", tar, BackendKind::Tarball),
        ];
        for (name, bytes, expected) in cases {
            let path = dir.path().join(name);
            fs::write(&path, bytes).unwrap();
            let backend = registry.detect_backend(&path).await.unwrap();
            assert_eq!(backend.kind(), expected, "{name}");
        }

        let elf = dir.path().join("tool");
        write_elf(&elf, 128);
        assert_eq!(registry.detect_backend(&elf).await.unwrap().kind(), BackendKind::Binary);
    }

    #[tokio::test]
    async fn test_squashfs_payload_is_appimage_not_binary() {
        let dir = tempfile::tempdir().unwrap();
        // No .AppImage extension and no type marker, only the payload.
        let path = dir.path().join("some-tool");
        write_appimage(&path);
        let registry = registry(dir.path());
        let backend = registry.detect_backend(&path).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::AppImage);
    }

    #[tokio::test]
    async fn test_unsupported_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let script = dir.path().join("install.sh");
        fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        let err = registry.detect_backend(&script).await.err().unwrap();
        match err {
            UpkgError::UnsupportedFormat { detected, hint, .. } => {
                assert_eq!(detected, "shell script");
                assert!(hint.unwrap().contains(".tar.gz"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let notes = dir.path().join("notes.txt");
        fs::write(&notes, "just some text\n").unwrap();
        let err = registry.detect_backend(&notes).await.err().unwrap();
        assert!(err.to_string().contains("text"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = registry(dir.path())
            .detect_backend(&dir.path().join("gone.deb"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UpkgError::NotFound(_)));
    }

    struct Failing;

    #[async_trait]
    impl Backend for Failing {
        fn kind(&self) -> BackendKind {
            BackendKind::Deb
        }

        async fn detect(&self, _path: &Path) -> UpkgResult<bool> {
            Err(UpkgError::InvalidInput("probe crashed".into()))
        }

        async fn install(
            &self,
            _path: &Path,
            _opts: &InstallOptions,
            _tx: &mut Transaction,
        ) -> UpkgResult<InstallRecord> {
            unreachable!()
        }

        async fn uninstall(&self, _record: &InstallRecord) -> UpkgResult<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_detection_error_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context(dir.path(), MockCommandRunner::new()));
        let backends: Vec<Box<dyn Backend>> = vec![Box::new(Failing), BackendKind::Binary.build(ctx)];
        let registry = Registry::with_backends(backends);
        let elf = dir.path().join("tool");
        write_elf(&elf, 128);
        assert_eq!(registry.detect_backend(&elf).await.unwrap().kind(), BackendKind::Binary);
    }

    #[test]
    fn test_lookup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert_eq!(registry.get_backend("AppImage").unwrap().kind(), BackendKind::AppImage);
        assert_eq!(registry.get_backend("zip").unwrap().kind(), BackendKind::Tarball);
        assert!(registry.get_backend("snap").is_err());
        assert_eq!(registry.list_backends(), BackendKind::PRIORITY.to_vec());
    }
}
