//! Debian packages.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use upkg_package::{detect_file, PackageFormat};

use super::{
    pipeline::{
        discard_scratch, remove_install, InstallPipeline, InstallPlan, Materialize, PackageInfo,
        Payload,
    },
    system, Backend, BackendContext, BackendKind,
};
use crate::{
    error::{ErrorContext, UpkgError, UpkgResult},
    record::{InstallOptions, InstallRecord, PackageType},
    runner::{CommandSpec, EXTRACT_TIMEOUT, METADATA_TIMEOUT},
    transaction::{Step, Transaction},
};

const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;

pub struct DebBackend {
    ctx: Arc<BackendContext>,
}

impl DebBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Backend for DebBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Deb
    }

    async fn detect(&self, path: &Path) -> UpkgResult<bool> {
        Ok(detect_file(path)? == PackageFormat::Deb)
    }

    async fn install(
        &self,
        path: &Path,
        opts: &InstallOptions,
        tx: &mut Transaction,
    ) -> UpkgResult<InstallRecord> {
        InstallPipeline::new(&self.ctx, opts)
            .run(path, &DebMaterializer { opts }, tx)
            .await
    }

    async fn uninstall(&self, record: &InstallRecord) -> UpkgResult<()> {
        remove_install(&self.ctx, record).await
    }
}

struct DebMaterializer<'a> {
    opts: &'a InstallOptions,
}

#[async_trait]
impl Materialize for DebMaterializer<'_> {
    fn package_type(&self, _source: &Path) -> PackageType {
        PackageType::Deb
    }

    async fn query_metadata(&self, ctx: &BackendContext, source: &Path) -> PackageInfo {
        query_control_fields(ctx, source).await
    }

    async fn materialize(
        &self,
        ctx: &BackendContext,
        source: &Path,
        plan: &InstallPlan,
        tx: &mut Transaction,
    ) -> UpkgResult<Payload> {
        let extracted = extract(ctx, source, &plan.install_dir, tx).await;
        match extracted {
            Ok(()) => {
                Ok(Payload::Tree {
                    root: plan.install_dir.clone(),
                    entry_point: None,
                })
            }
            Err(err) if system::deb_system_path_available(ctx) => {
                warn!(error = %err, "direct extraction failed, installing through pacman");
                let package =
                    system::install_deb(ctx, source, &plan.install_dir, self.opts, tx).await?;
                Ok(Payload::SystemManaged { package })
            }
            Err(err) => Err(err),
        }
    }
}

/// `dpkg-deb -f <file> Package Version`, when dpkg-deb is installed.
pub(crate) async fn query_control_fields(ctx: &BackendContext, source: &Path) -> PackageInfo {
    if !ctx.runner.exists("dpkg-deb") {
        return PackageInfo::default();
    }

    let spec = CommandSpec::new("dpkg-deb")
        .arg("-f")
        .arg(source.to_string_lossy())
        .args(["Package", "Version"])
        .timeout(METADATA_TIMEOUT);
    match ctx.runner.run_checked(&spec).await {
        Ok(output) => parse_control_fields(&output.stdout),
        Err(err) => {
            debug!(error = %err, "dpkg-deb metadata query failed");
            PackageInfo::default()
        }
    }
}

fn parse_control_fields(stdout: &str) -> PackageInfo {
    let mut info = PackageInfo::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "Package" => info.name = Some(value.to_string()),
            "Version" => info.version = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

/// Unpacks the data archive of `deb` into `dest`: `dpkg-deb -x` when available,
/// otherwise by reading the ar container directly.
pub(crate) async fn extract(
    ctx: &BackendContext,
    deb: &Path,
    dest: &Path,
    tx: &mut Transaction,
) -> UpkgResult<()> {
    if ctx.runner.exists("dpkg-deb") {
        let spec = CommandSpec::new("dpkg-deb")
            .arg("-x")
            .arg(deb.to_string_lossy())
            .arg(dest.to_string_lossy())
            .timeout(EXTRACT_TIMEOUT);
        info!(path = %deb.display(), "extracting with dpkg-deb");
        return ctx.runner.run_checked(&spec).await.map(|_| ());
    }

    info!(path = %deb.display(), "extracting data archive");
    let member = extract_ar_member(deb, "data.tar", dest)?.ok_or_else(|| {
        UpkgError::InvalidInput(format!("{} has no data.tar member", deb.display()))
    })?;
    tx.record(Step::created_file(&member));

    let (archive, out) = (member.clone(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || compak::extract_archive(&archive, &out))
        .await
        .map_err(|e| {
            UpkgError::ExternalToolFailure {
                command: "extract data archive".into(),
                reason: e.to_string(),
            }
        })??;

    discard_scratch(ctx, &member);
    Ok(())
}

/// Copies the first ar member whose name starts with `prefix` into `dest_dir`,
/// keeping the member name. Returns `None` if there is no such member.
pub fn extract_ar_member(
    archive: &Path,
    prefix: &str,
    dest_dir: &Path,
) -> UpkgResult<Option<PathBuf>> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .with_context(|| format!("reading {}", archive.display()))?;
    if &magic != AR_MAGIC {
        return Err(UpkgError::InvalidInput(format!(
            "{} is not an ar archive",
            archive.display()
        )));
    }

    loop {
        let mut header = [0u8; AR_HEADER_LEN];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => {
                return Err(UpkgError::IoError {
                    action: format!("reading {}", archive.display()),
                    source: err,
                });
            }
        }
        if &header[58..60] != b"`\n" {
            return Err(UpkgError::InvalidInput(format!(
                "{} has a corrupt ar header",
                archive.display()
            )));
        }

        let name = String::from_utf8_lossy(&header[0..16])
            .trim_end()
            .trim_end_matches('/')
            .to_string();
        let size: u64 = String::from_utf8_lossy(&header[48..58])
            .trim()
            .parse()
            .map_err(|_| {
                UpkgError::InvalidInput(format!(
                    "{} has a corrupt ar member size",
                    archive.display()
                ))
            })?;

        if name.starts_with(prefix) && !name.contains('/') {
            let dest = dest_dir.join(&name);
            let mut out =
                File::create(&dest).with_context(|| format!("creating {}", dest.display()))?;
            let copied = io::copy(&mut (&mut reader).take(size), &mut out)
                .with_context(|| format!("writing {}", dest.display()))?;
            if copied != size {
                return Err(UpkgError::InvalidInput(format!(
                    "{} is truncated",
                    archive.display()
                )));
            }
            debug!(member = %name, size, "extracted ar member");
            return Ok(Some(dest));
        }

        // Members are padded to an even offset.
        let skip = size + (size % 2);
        reader
            .seek(SeekFrom::Current(skip as i64))
            .with_context(|| format!("reading {}", archive.display()))?;
    }
}
