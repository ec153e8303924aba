//! Canonicalization-first path validation.
//!
//! The order of operations is the whole point: a candidate path is made
//! absolute, then *fully resolved* (every symlink followed), and only the
//! resolved result is compared against the allow- and deny-lists. Textual
//! `..` sequences are never rejected on sight — they disappear during
//! resolution, and the resolved path is what gets judged. A symlink pointing
//! outside the allowed roots therefore fails even when the link itself lives
//! inside them.
//!
//! [`open_secure_file`] closes the remaining TOCTOU window: the file handle
//! is obtained first, then the path is re-resolved and revalidated, and the
//! handle's identity (device + inode) is compared against the revalidated
//! target. A race that swaps the target between check and open produces a
//! mismatch and the handle is dropped.

use std::fs::{File, Metadata, OpenOptions};
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;

use crate::error::CoreError;

/// Directory roots a validated path must resolve into, plus resolved paths
/// that are refused outright.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    allowed_roots: Vec<PathBuf>,
    blocked: Vec<PathBuf>,
}

impl PathPolicy {
    /// Policy for the running process: user home, current working tree, and
    /// the system temp directory; deny-list of sensitive system locations.
    pub fn from_environment() -> Self {
        let mut allowed_roots = Vec::new();
        if let Some(home) = dirs::home_dir() {
            allowed_roots.push(resolve_best_effort(&home));
        }
        if let Ok(cwd) = std::env::current_dir() {
            allowed_roots.push(resolve_best_effort(&cwd));
        }
        allowed_roots.push(resolve_best_effort(&std::env::temp_dir()));

        let blocked = [
            "/etc/passwd",
            "/etc/shadow",
            "/etc/sudoers",
            "/etc/ssh",
            "/boot",
            "/proc",
            "/sys",
            "/dev",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        Self { allowed_roots, blocked }
    }

    /// Policy with explicit roots, for embedding and tests.
    pub fn new(allowed_roots: Vec<PathBuf>, blocked: Vec<PathBuf>) -> Self {
        Self {
            allowed_roots: allowed_roots.iter().map(|p| resolve_best_effort(p)).collect(),
            blocked,
        }
    }

    /// Validate a candidate path and return its fully resolved form.
    ///
    /// Errors: [`CoreError::PathNotFound`] when any component fails to
    /// resolve, [`CoreError::BlockedPath`] when the resolved path sits under
    /// a deny-list entry, [`CoreError::PathTraversal`] when it resolves
    /// outside every allowed root.
    pub fn validate(&self, candidate: &Path) -> Result<PathBuf, CoreError> {
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| CoreError::PathNotFound(format!("{}: {e}", candidate.display())))?
                .join(candidate)
        };

        // Resolve every symlink. Failure here covers both dangling links and
        // plainly missing files.
        let real = std::fs::canonicalize(&absolute)
            .map_err(|_| CoreError::PathNotFound(absolute.display().to_string()))?;

        // Deny-list entries are resolved too, so /etc -> /private/etc style
        // platform symlinks cannot be used to sidestep them.
        for blocked in &self.blocked {
            let blocked_real = resolve_best_effort(blocked);
            if is_path_within_dir(&real, &blocked_real) {
                return Err(CoreError::BlockedPath(real.display().to_string()));
            }
        }

        if self
            .allowed_roots
            .iter()
            .any(|root| is_path_within_dir(&real, root))
        {
            Ok(real)
        } else {
            Err(CoreError::PathTraversal(real.display().to_string()))
        }
    }

    /// Atomic open-and-revalidate.
    ///
    /// Opens the file first, then revalidates the path and checks that the
    /// open handle refers to the same filesystem object the validation saw.
    /// On any mismatch the handle is dropped and an error returned.
    pub fn open_secure(&self, candidate: &Path, mode: OpenMode) -> Result<(File, PathBuf), CoreError> {
        let file = mode
            .options()
            .open(candidate)
            .map_err(|_| CoreError::PathNotFound(candidate.display().to_string()))?;

        // Revalidate *after* the open, against the now-current resolution.
        let real = self.validate(candidate)?;

        let handle_meta = file
            .metadata()
            .map_err(|e| CoreError::PathNotFound(format!("{}: {e}", candidate.display())))?;
        let path_meta = std::fs::metadata(&real)
            .map_err(|_| CoreError::PathNotFound(real.display().to_string()))?;

        if !same_file(&handle_meta, &path_meta) {
            // The target changed between open and revalidation.
            return Err(CoreError::PathTraversal(format!(
                "{} changed during open",
                candidate.display()
            )));
        }

        Ok((file, real))
    }
}

/// How [`PathPolicy::open_secure`] should open the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Write without create — creating through a validated parent is the
    /// caller's job, since a not-yet-existing path cannot be resolved.
    Write,
    Append,
}

impl OpenMode {
    fn options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            Self::Read => opts.read(true),
            Self::Write => opts.write(true),
            Self::Append => opts.append(true),
        };
        opts
    }
}

/// Directory-boundary predicate: `path` equals `dir` or sits strictly below
/// it. Comparison is component-wise, so `/home/userEVIL` is *not* within
/// `/home/user` — the string-prefix bypass does not apply.
pub fn is_path_within_dir(path: &Path, dir: &Path) -> bool {
    let mut path_components = path.components();
    for dir_component in dir.components() {
        // Skip the root marker mismatch cases by comparing exact components.
        match path_components.next() {
            Some(c) if c == dir_component => continue,
            _ => return false,
        }
    }
    // Either exhausted (equality) or the remainder starts at a component
    // boundary (strictly below).
    true
}

#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    // Best effort off unix: size + modified time.
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

fn resolve_best_effort(p: &Path) -> PathBuf {
    std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())
}

static SENSITIVE_GLOBS: Lazy<GlobSet> = Lazy::new(|| {
    let patterns = [
        "**/.env*",
        "**/.aws/**",
        "**/.ssh/**",
        "**/*credentials*",
        "**/*credentials*/**",
        "**/*secrets*",
        "**/*secrets*/**",
        "**/.git/config",
        "**/*.pem",
        "**/*.key",
    ];
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).expect("sensitive-path glob must compile"));
    }
    builder.build().expect("sensitive-path glob set must build")
});

/// Whether a path matches the secret-bearing deny patterns.
///
/// Used by filesystem tools to upgrade their dynamic permission from `Auto`
/// to `Ask` when a read or write touches likely credential material.
pub fn is_sensitive_path(path: &Path) -> bool {
    SENSITIVE_GLOBS.is_match(path)
}

/// Validate a path against the process-environment policy.
pub fn validate_path_secure(candidate: &Path) -> Result<PathBuf, CoreError> {
    PathPolicy::from_environment().validate(candidate)
}

/// Open a file with the process-environment policy's TOCTOU defense.
pub fn open_secure_file(candidate: &Path, mode: OpenMode) -> Result<(File, PathBuf), CoreError> {
    PathPolicy::from_environment().open_secure(candidate, mode)
}
