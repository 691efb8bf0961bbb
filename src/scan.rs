//! Local repository scanner.
//!
//! Walks a directory and returns the text files worth analysing as
//! [`SourceFile`]s, sorted by relative path. Skipped:
//!
//! - version-control, dependency, virtualenv and build-output directories
//! - paths matching `scan.exclude_globs`
//! - files larger than `scan.max_file_bytes`
//! - binary files (a NUL byte in the first 8 KiB)
//!
//! Content is decoded as UTF-8, lossily, so stray invalid bytes in an
//! otherwise textual file do not drop it.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::config::ScanConfig;
use crate::models::SourceFile;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "__pycache__",
    ".pytest_cache",
    "venv",
    ".venv",
    "env",
    "dist",
    "build",
    "target",
    ".next",
    ".nuxt",
    ".idea",
    ".vscode",
    "coverage",
    ".nyc_output",
];

const BINARY_SNIFF_BYTES: usize = 8 * 1024;

fn is_ignored_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// Scan `root` into an ordered list of text files.
pub fn scan_directory(root: &Path, config: &ScanConfig) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Repository root is not a directory: {}", root.display());
    }

    let exclude_set = build_globset(&config.exclude_globs)?;
    let mut files = Vec::new();
    let mut skipped = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }

        match read_text_file(path, config.max_file_bytes) {
            Ok(Some(content)) => files.push(SourceFile::new(rel_str, content)),
            Ok(None) => {
                tracing::debug!(path = %rel_str, "skipping binary or oversized file");
                skipped += 1;
            }
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %format!("{e:#}"), "skipping unreadable file");
                skipped += 1;
            }
        }
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::info!(
        root = %root.display(),
        files = files.len(),
        skipped,
        "scan complete"
    );
    Ok(files)
}

/// Read a file as text, or `None` when it is too large or looks binary.
fn read_text_file(path: &Path, max_bytes: u64) -> Result<Option<String>> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    if metadata.len() > max_bytes {
        return Ok(None);
    }

    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid exclude glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}
