//! Picking the main executable out of an extracted package tree.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};
use upkg_utils::fs::{is_elf, is_executable, walk_dir};

use crate::error::UpkgResult;

/// File name fragments that mark helper binaries rather than the application.
pub const PENALTY_PATTERNS: &[&str] = &[
    "chrome-sandbox",
    "crashpad",
    "minidump",
    "update",
    "uninstall",
    "helper",
    "crash",
    "debugger",
    "sandbox",
    "nacl",
    "xdg",
    "installer",
    "setup",
    "config",
    "daemon",
    "service",
    "agent",
    "monitor",
    "reporter",
];

const MAX_DEPTH: i64 = 10;
const MB: u64 = 1024 * 1024;
const KB: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCandidate {
    pub path: PathBuf,
    pub score: i64,
}

/// Executable ELF files below `root`, in traversal order.
pub fn find_candidates(root: &Path) -> UpkgResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk_dir(root, &mut |path: &Path| -> UpkgResult<()> {
        if is_executable(path) && is_elf(path) {
            found.push(path.to_path_buf());
        }
        Ok(())
    })?;
    trace!(root = %root.display(), count = found.len(), "found executable candidates");
    Ok(found)
}

/// Scores a candidate; higher is more likely the application binary.
pub fn score_candidate(path: &Path, base_name: &str, root: &Path) -> i64 {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let depth = relative.components().count() as i64;

    let mut score = (MAX_DEPTH + 1 - depth) * 10;
    if depth > MAX_DEPTH {
        score -= 50;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let base = base_name.to_ascii_lowercase();

    let exact = file_name == base || file_name.strip_suffix(".exe") == Some(base.as_str());
    if exact {
        score += 100;
    } else if !base.is_empty() && file_name.contains(&base) {
        score += 50;
    }

    let penalties = PENALTY_PATTERNS
        .iter()
        .filter(|p| file_name.contains(*p))
        .count() as i64;
    score -= penalties * 200;

    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size > 10 * MB {
        score += 30;
    } else if size > MB {
        score += 10;
    } else if size < 100 * KB {
        score -= 20;
    }

    let rel = format!("/{}", relative.to_string_lossy().to_ascii_lowercase());
    if rel.contains("/bin/") {
        score += 20;
    }

    score
}

/// Ranks `candidates`, best first. Equal scores keep their input order.
pub fn rank_candidates(candidates: &[PathBuf], base_name: &str, root: &Path) -> Vec<ExecCandidate> {
    let mut scored: Vec<ExecCandidate> = candidates
        .iter()
        .map(|path| {
            ExecCandidate {
                score: score_candidate(path, base_name, root),
                path: path.clone(),
            }
        })
        .collect();
    // Stable: ties resolve to the first-seen candidate.
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored
}

/// Chooses the main executable. A single candidate is returned without scoring.
pub fn select_executable(candidates: &[PathBuf], base_name: &str, root: &Path) -> Option<PathBuf> {
    match candidates {
        [] => None,
        [only] => Some(only.clone()),
        _ => {
            let ranked = rank_candidates(candidates, base_name, root);
            for c in ranked.iter().take(3) {
                debug!(path = %c.path.display(), score = c.score, "executable candidate");
            }
            ranked.into_iter().next().map(|c| c.path)
        }
    }
}
