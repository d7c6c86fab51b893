//! Engine source archive
//!
//! Packs the local engine directory into a gzip'd tarball the VM unpacks
//! with a stock `tar -xzf`.

use std::fs;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;
use walkdir::WalkDir;

use crate::errors::OrchestratorError;

/// Directories never shipped to the VM
pub const ALWAYS_EXCLUDED: &[&str] = &[".git", "node_modules", "target", "__pycache__"];

/// Build the archive on the blocking pool; returns its size in bytes
pub async fn build_archive(
    source_dir: &Path,
    archive_path: &Path,
    excludes: &[String],
) -> Result<u64, OrchestratorError> {
    let source_dir = source_dir.to_path_buf();
    let archive_path = archive_path.to_path_buf();
    let excludes = excludes.to_vec();

    tokio::task::spawn_blocking(move || create_tarball(&source_dir, &archive_path, &excludes))
        .await
        .map_err(|e| OrchestratorError::Internal(format!("archive task failed: {}", e)))?
}

fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        ALWAYS_EXCLUDED.contains(&name.as_ref()) || excludes.iter().any(|e| e == name.as_ref())
    })
}

pub fn create_tarball(
    source_dir: &Path,
    archive_path: &Path,
    excludes: &[String],
) -> Result<u64, OrchestratorError> {
    if !source_dir.is_dir() {
        return Err(OrchestratorError::LocalIo(format!(
            "engine source directory {} does not exist",
            source_dir.display()
        )));
    }
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            OrchestratorError::LocalIo(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }

    let file = fs::File::create(archive_path).map_err(|e| {
        OrchestratorError::LocalIo(format!("cannot create {}: {}", archive_path.display(), e))
    })?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

    let mut entries: Vec<(PathBuf, bool)> = Vec::new();
    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(source_dir)
                .map(|rel| !is_excluded(rel, excludes))
                .unwrap_or(true)
        });
    for entry in walker {
        let entry = entry.map_err(|e| {
            OrchestratorError::LocalIo(format!("cannot walk {}: {}", source_dir.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|_| OrchestratorError::Internal("archive path outside source".to_string()))?;
        if rel.as_os_str().is_empty() || entry.file_type().is_symlink() {
            continue;
        }
        if entry.file_type().is_dir() || entry.file_type().is_file() {
            entries.push((rel.to_path_buf(), entry.file_type().is_dir()));
        }
    }
    entries.sort();

    for (rel, is_dir) in &entries {
        let src = source_dir.join(rel);
        let added = if *is_dir {
            builder.append_dir(rel, &src)
        } else {
            builder.append_path_with_name(&src, rel)
        };
        added.map_err(|e| {
            OrchestratorError::LocalIo(format!("cannot add {} to archive: {}", src.display(), e))
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| OrchestratorError::LocalIo(format!("cannot finalize archive: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| OrchestratorError::LocalIo(format!("cannot finish archive: {}", e)))?;

    let size = fs::metadata(archive_path)?.len();
    Ok(size)
}
