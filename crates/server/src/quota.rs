//! Disk quota enforcement for the cache directory.
//!
//! Before an upload is accepted the server frees space by deleting the
//! least-recently-touched files first. Downloads refresh a file's mtime, so
//! eviction approximates LRU by request. Uploads still being received live
//! in staging files; they count against the quota but are never evicted.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use assetcache_transfer::is_partial_name;
use tracing::{debug, info, warn};

use crate::ServerError;

/// One file in the cache directory.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    /// Staging file of an upload that has not completed.
    pub in_progress: bool,
}

/// Lists every file under `dir`, recursively.
///
/// An unreadable root is an error; unreadable subdirectories are skipped.
pub fn scan_cache(dir: &Path) -> Result<Vec<CacheEntry>, ServerError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        collect(entry?, &mut entries);
    }
    Ok(entries)
}

fn collect(entry: std::fs::DirEntry, out: &mut Vec<CacheEntry>) {
    let path = entry.path();
    let Ok(meta) = entry.metadata() else {
        return;
    };
    if meta.is_dir() {
        let Ok(children) = std::fs::read_dir(&path) else {
            return;
        };
        for child in children.flatten() {
            collect(child, out);
        }
    } else {
        let in_progress = is_partial_name(&entry.file_name().to_string_lossy());
        out.push(CacheEntry {
            path,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            in_progress,
        });
    }
}

/// Total size of all files under `dir`.
pub fn cache_size(dir: &Path) -> Result<u64, ServerError> {
    Ok(scan_cache(dir)?.iter().map(|e| e.size).sum())
}

fn has_room(quota: u64, current: u64, required: u64) -> bool {
    current < quota && quota - current > required
}

/// Deletes staging files left behind by uploads that never finished.
///
/// Only safe before any peer is active. Returns how many were removed.
pub fn remove_stale_partials(dir: &Path) -> Result<usize, ServerError> {
    let mut removed = 0;
    for entry in scan_cache(dir)?.into_iter().filter(|e| e.in_progress) {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(path = %entry.path.display(), "removed stale partial upload");
                removed += 1;
            }
            Err(e) => warn!(path = %entry.path.display(), "failed to remove partial upload: {e}"),
        }
    }
    Ok(removed)
}

/// Makes room for a file of `required` bytes under a `quota` in bytes.
///
/// Deletes completed files oldest-mtime first (stable order for ties)
/// until the new file fits. Staging files of in-progress uploads count
/// toward the total but are skipped. Returns `false` if it cannot fit even with the cache empty;
/// a file that alone exceeds the quota is refused without deleting
/// anything.
pub fn ensure_available_space(dir: &Path, required: u64, quota: u64) -> Result<bool, ServerError> {
    if required >= quota {
        warn!(required, quota, "file exceeds cache quota");
        return Ok(false);
    }

    let mut entries = scan_cache(dir)?;
    let mut current: u64 = entries.iter().map(|e| e.size).sum();
    if has_room(quota, current, required) {
        return Ok(true);
    }

    entries.sort_by_key(|e| e.modified);
    for entry in entries.into_iter().filter(|e| !e.in_progress) {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                current = current.saturating_sub(entry.size);
                debug!(path = %entry.path.display(), size = entry.size, "evicted");
            }
            Err(e) => {
                warn!(path = %entry.path.display(), "failed to evict: {e}");
                continue;
            }
        }
        if has_room(quota, current, required) {
            info!(required, current, quota, "cache space reclaimed");
            return Ok(true);
        }
    }

    warn!(required, current, quota, "unable to reclaim enough cache space");
    Ok(false)
}
