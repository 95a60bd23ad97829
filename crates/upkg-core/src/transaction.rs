//! Undo log for install side effects.
//!
//! Every filesystem mutation and command an install performs is recorded as a
//! [`Step`]. A failed install calls [`Transaction::rollback`], which undoes the
//! steps newest first. A successful one calls [`Transaction::commit`].

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, trace, warn};
use upkg_utils::{fs::FileSystemProvider, lock::FileLock};

use crate::{
    error::{UpkgError, UpkgResult},
    runner::{CommandRunner, CommandSpec},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// A file that did not exist before.
    CreatedFile { path: PathBuf },
    /// A directory that did not exist before, removed recursively on undo.
    CreatedDir { path: PathBuf },
    /// A file that was overwritten or created, with its previous contents and mode.
    ModifiedFile {
        path: PathBuf,
        original: Option<Vec<u8>>,
        mode: Option<u32>,
    },
    /// An existing artifact renamed to `backup` so a new one can take its place.
    MovedAside { path: PathBuf, backup: PathBuf },
    /// A command with system-wide effects and the command that reverses it.
    RanCommand {
        command: CommandSpec,
        compensation: Option<CommandSpec>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub description: String,
    pub kind: StepKind,
}

impl Step {
    pub fn created_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            description: format!("created {}", path.display()),
            kind: StepKind::CreatedFile { path },
        }
    }

    pub fn created_dir(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            description: format!("created directory {}", path.display()),
            kind: StepKind::CreatedDir { path },
        }
    }

    pub fn modified_file(path: impl Into<PathBuf>, original: Option<Vec<u8>>) -> Self {
        let path = path.into();
        Self {
            description: format!("modified {}", path.display()),
            kind: StepKind::ModifiedFile {
                path,
                original,
                mode: None,
            },
        }
    }

    /// Like [`Step::modified_file`], also restoring the permission bits on undo.
    pub fn modified_file_with_mode(
        path: impl Into<PathBuf>,
        original: Vec<u8>,
        mode: u32,
    ) -> Self {
        let path = path.into();
        Self {
            description: format!("modified {}", path.display()),
            kind: StepKind::ModifiedFile {
                path,
                original: Some(original),
                mode: Some(mode),
            },
        }
    }

    pub fn moved_aside(path: impl Into<PathBuf>, backup: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup = backup.into();
        Self {
            description: format!("moved {} to {}", path.display(), backup.display()),
            kind: StepKind::MovedAside { path, backup },
        }
    }

    pub fn ran_command(command: CommandSpec, compensation: Option<CommandSpec>) -> Self {
        Self {
            description: format!("ran `{command}`"),
            kind: StepKind::RanCommand {
                command,
                compensation,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

pub struct Transaction {
    steps: Vec<Step>,
    state: TransactionState,
    fs: Arc<dyn FileSystemProvider>,
    runner: Arc<dyn CommandRunner>,
    locks: Vec<FileLock>,
}

impl Transaction {
    pub fn new(fs: Arc<dyn FileSystemProvider>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            steps: Vec::new(),
            state: TransactionState::Active,
            fs,
            runner,
            locks: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn record(&mut self, step: Step) {
        trace!(step = %step.description, "recorded step");
        self.steps.push(step);
    }

    /// Keeps `lock` held until the transaction is committed, rolled back or dropped.
    pub fn hold_lock(&mut self, lock: FileLock) {
        self.locks.push(lock);
    }

    /// Creates `path` and any missing parents, recording each new directory.
    pub fn create_dir_all(&mut self, path: &Path) -> UpkgResult<()> {
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(dir) = current {
            if dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
            current = dir.parent();
        }

        self.fs.ensure_dir_exists(path)?;
        for dir in missing.into_iter().rev() {
            self.record(Step::created_dir(dir));
        }
        Ok(())
    }

    /// Writes `contents` to `path` with `mode`, snapshotting any previous file.
    ///
    /// The step is recorded before writing, so a write that fails halfway is
    /// still undone.
    pub fn write_file(&mut self, path: &Path, contents: &[u8], mode: u32) -> UpkgResult<()> {
        let step = match (fs::read(path), fs::metadata(path)) {
            (Ok(original), Ok(meta)) => {
                Step::modified_file_with_mode(path, original, meta.permissions().mode())
            }
            (Ok(original), Err(_)) => Step::modified_file(path, Some(original)),
            (Err(_), _) => Step::created_file(path),
        };
        self.record(step);
        self.fs.write_file(path, contents, mode)?;
        Ok(())
    }

    /// Renames an existing `path` to a sibling backup, restored on rollback and
    /// deleted on commit. Returns the backup path, or `None` if nothing was there.
    pub fn move_aside(&mut self, path: &Path) -> UpkgResult<Option<PathBuf>> {
        if fs::symlink_metadata(path).is_err() {
            return Ok(None);
        }

        let file_name = path
            .file_name()
            .ok_or_else(|| UpkgError::InvalidInput(format!("cannot replace {}", path.display())))?
            .to_string_lossy();
        let mut backup = path.with_file_name(format!(".{file_name}.upkg-backup"));
        let mut n = 1;
        while fs::symlink_metadata(&backup).is_ok() {
            backup = path.with_file_name(format!(".{file_name}.upkg-backup.{n}"));
            n += 1;
        }

        self.fs.rename(path, &backup)?;
        debug!(path = %path.display(), backup = %backup.display(), "moved existing artifact aside");
        self.record(Step::moved_aside(path, &backup));
        Ok(Some(backup))
    }

    /// Marks the transaction successful and discards backups of replaced artifacts.
    pub fn commit(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        self.state = TransactionState::Committed;

        for step in &self.steps {
            if let StepKind::MovedAside { backup, .. } = &step.kind {
                if let Err(err) = self.fs.safe_remove(backup) {
                    warn!(backup = %backup.display(), error = %err, "failed to remove backup");
                }
            }
        }
        debug!(steps = self.steps.len(), "transaction committed");
        self.steps.clear();
        self.locks.clear();
    }

    /// Undoes every recorded step, newest first.
    ///
    /// Undo failures do not stop the rollback; they are collected into one
    /// [`UpkgError::Rollback`]. Calling this again, or after [`commit`](Self::commit),
    /// does nothing.
    pub async fn rollback(&mut self) -> UpkgResult<()> {
        if self.state != TransactionState::Active {
            return Ok(());
        }
        self.state = TransactionState::RolledBack;

        let mut failures = Vec::new();
        while let Some(step) = self.steps.pop() {
            trace!(step = %step.description, "undoing step");
            let result = match &step.kind {
                StepKind::RanCommand {
                    compensation: Some(compensation),
                    ..
                } => self.run_compensation(compensation).await,
                kind => self.undo_fs(kind),
            };
            if let Err(err) = result {
                warn!(step = %step.description, error = %err, "failed to undo step");
                failures.push(format!("{}: {err}", step.description));
            }
        }
        self.locks.clear();

        if failures.is_empty() {
            debug!("transaction rolled back");
            Ok(())
        } else {
            Err(UpkgError::Rollback(failures))
        }
    }

    async fn run_compensation(&self, spec: &CommandSpec) -> UpkgResult<()> {
        self.runner.run_checked(spec).await.map(|_| ())
    }

    fn undo_fs(&self, kind: &StepKind) -> UpkgResult<()> {
        match kind {
            StepKind::CreatedFile { path } | StepKind::CreatedDir { path } => {
                self.fs.safe_remove(path)?;
            }
            StepKind::ModifiedFile {
                path,
                original: Some(original),
                mode,
            } => {
                fs::write(path, original).map_err(|err| {
                    UpkgError::IoError {
                        action: format!("restoring {}", path.display()),
                        source: err,
                    }
                })?;
                if let Some(mode) = mode {
                    fs::set_permissions(path, fs::Permissions::from_mode(*mode)).map_err(|err| {
                        UpkgError::IoError {
                            action: format!("restoring mode of {}", path.display()),
                            source: err,
                        }
                    })?;
                }
            }
            StepKind::ModifiedFile {
                path,
                original: None,
                ..
            } => {
                self.fs.safe_remove(path)?;
            }
            StepKind::MovedAside { path, backup } => {
                self.fs.safe_remove(path)?;
                self.fs.rename(backup, path)?;
            }
            StepKind::RanCommand { command, .. } => {
                debug!(command = %command, "no compensation recorded");
            }
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Active || self.steps.is_empty() {
            return;
        }

        warn!(
            steps = self.steps.len(),
            "transaction dropped without commit, undoing filesystem steps"
        );
        while let Some(step) = self.steps.pop() {
            if let StepKind::RanCommand {
                compensation: Some(compensation),
                ..
            } = &step.kind
            {
                warn!(command = %compensation, "skipping compensation outside of async rollback");
                continue;
            }
            if let Err(err) = self.undo_fs(&step.kind) {
                warn!(step = %step.description, error = %err, "failed to undo step");
            }
        }
        self.state = TransactionState::RolledBack;
    }
}
