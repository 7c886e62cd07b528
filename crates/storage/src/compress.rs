//! Out-of-band compression of exports marked `success_compress`.
//!
//! An entry moves `success_compress` -> `success_compressing` -> `success`.
//! Every state counts as a successful backup, so the lifecycle engine never
//! reclaims an entry while it is being compressed. Entries left in
//! `success_compressing` by an interrupted sweep are resumed.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use vmbackup_core::MarkerState;

use crate::error::{LifecycleError, Result};
use crate::lifecycle::{write_marker, BackupRoot};

pub const DEFAULT_LEVEL: i32 = 3;

const SKIP_EXTENSIONS: [&str; 2] = ["gz", "zst"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompressReport {
    pub entries: Vec<PathBuf>,
    pub files: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Compresses pending entries in every VM root under `backup_dir`.
pub fn compress_backup_dir(backup_dir: &Path, level: i32) -> Result<CompressReport> {
    let mut report = CompressReport::default();
    let vm_roots = fs::read_dir(backup_dir).map_err(|source| LifecycleError::List {
        path: backup_dir.to_path_buf(),
        source,
    })?;
    for item in readable_items(backup_dir, vm_roots) {
        let path = item.path();
        if !path.is_dir() {
            continue;
        }
        let root = BackupRoot::new(path);
        match compress_pending(&root, level) {
            Ok(part) => report.merge(part),
            Err(err) => warn!(root = %root.path().display(), error = %err, "compression sweep failed"),
        }
    }
    Ok(report)
}

/// Compresses every pending entry of one VM root.
pub fn compress_pending(root: &BackupRoot, level: i32) -> Result<CompressReport> {
    let mut report = CompressReport::default();
    for name in root.entry_names()? {
        let entry = root.path().join(&name);
        if !is_pending(&entry) {
            continue;
        }
        let part = compress_entry(&entry, level)?;
        report.merge(part);
    }
    Ok(report)
}

/// Listing items that could be read; the rest are logged and skipped.
fn readable_items<T>(dir: &Path, items: impl IntoIterator<Item = io::Result<T>>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory item");
                None
            }
        })
        .collect()
}

fn is_pending(entry: &Path) -> bool {
    [MarkerState::SuccessCompressed, MarkerState::SuccessCompressing]
        .into_iter()
        .filter_map(MarkerState::file_name)
        .any(|file| entry.join(file).exists())
}

pub fn compress_entry(entry: &Path, level: i32) -> Result<CompressReport> {
    let mut report = CompressReport::default();
    let pending = marker_path(entry, MarkerState::SuccessCompressed);
    let compressing = marker_path(entry, MarkerState::SuccessCompressing);
    if pending.exists() {
        fs::rename(&pending, &compressing).map_err(|source| LifecycleError::Marker {
            path: compressing.clone(),
            source,
        })?;
    }

    let listing = fs::read_dir(entry).map_err(|source| LifecycleError::List {
        path: entry.to_path_buf(),
        source,
    })?;
    // A payload that cannot be listed must not be marked done; the entry
    // stays `success_compressing` and the next sweep resumes it.
    let listing = listing
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| LifecycleError::List {
            path: entry.to_path_buf(),
            source,
        })?;
    for item in listing {
        let path = item.path();
        if !path.is_file() || !is_payload(&path) {
            continue;
        }
        let (bytes_in, bytes_out) =
            compress_file(&path, level).map_err(|source| LifecycleError::Compress {
                path: path.clone(),
                source,
            })?;
        report.files += 1;
        report.bytes_in += bytes_in;
        report.bytes_out += bytes_out;
    }

    write_marker(entry, MarkerState::Success)?;
    if compressing.exists() {
        fs::remove_file(&compressing).map_err(|source| LifecycleError::Marker {
            path: compressing.clone(),
            source,
        })?;
    }
    info!(
        entry = %entry.display(),
        files = report.files,
        bytes_in = report.bytes_in,
        bytes_out = report.bytes_out,
        "compressed backup entry"
    );
    report.entries.push(entry.to_path_buf());
    Ok(report)
}

fn marker_path(entry: &Path, marker: MarkerState) -> PathBuf {
    entry.join(marker.file_name().unwrap_or_default())
}

fn is_payload(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if MarkerState::from_file_name(name).is_some() {
        return false;
    }
    !path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SKIP_EXTENSIONS.contains(&ext))
}

fn compress_file(path: &Path, level: i32) -> io::Result<(u64, u64)> {
    let mut target = path.as_os_str().to_owned();
    target.push(".zst");
    let target = PathBuf::from(target);

    let bytes_in = fs::metadata(path)?.len();
    let result = File::open(path).and_then(|source| {
        let sink = File::create(&target)?;
        zstd::stream::copy_encode(source, sink, level)
    });
    if let Err(err) = result {
        let _ = fs::remove_file(&target);
        return Err(err);
    }
    let bytes_out = fs::metadata(&target)?.len();
    fs::remove_file(path)?;
    Ok((bytes_in, bytes_out))
}

impl CompressReport {
    fn merge(&mut self, other: CompressReport) {
        self.entries.extend(other.entries);
        self.files += other.files;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(root: &Path, name: &str, marker: &str) -> PathBuf {
        let entry = root.join(name);
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("web01.xva"), vec![b'x'; 64 * 1024]).unwrap();
        fs::write(entry.join(marker), b"").unwrap();
        entry
    }

    #[test]
    fn compresses_pending_entry_and_marks_success() {
        let tmp = tempfile::tempdir().unwrap();
        let root = BackupRoot::new(tmp.path().join("web01"));
        let entry = entry_with(root.path(), "backup-A", "success_compress");

        let report = compress_pending(&root, DEFAULT_LEVEL).unwrap();
        assert_eq!(report.entries, vec![entry.clone()]);
        assert_eq!(report.files, 1);
        assert!(report.bytes_out < report.bytes_in);

        assert!(entry.join("web01.xva.zst").exists());
        assert!(!entry.join("web01.xva").exists());
        assert!(entry.join("success").exists());
        assert!(!entry.join("success_compress").exists());
        assert!(!entry.join("success_compressing").exists());

        let restored = zstd::decode_all(File::open(entry.join("web01.xva.zst")).unwrap()).unwrap();
        assert_eq!(restored.len(), 64 * 1024);
    }

    #[test]
    fn leaves_completed_entries_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let root = BackupRoot::new(tmp.path().join("web01"));
        let entry = entry_with(root.path(), "backup-A", "success");

        let report = compress_pending(&root, DEFAULT_LEVEL).unwrap();
        assert!(report.entries.is_empty());
        assert!(entry.join("web01.xva").exists());
    }

    #[test]
    fn resumes_interrupted_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let root = BackupRoot::new(tmp.path().join("web01"));
        let entry = entry_with(root.path(), "backup-A", "success_compressing");
        fs::write(entry.join("done.raw.zst"), b"already").unwrap();

        let report = compress_pending(&root, DEFAULT_LEVEL).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(fs::read(entry.join("done.raw.zst")).unwrap(), b"already");
        assert_eq!(root.marker_state("backup-A"), MarkerState::Success);
    }

    #[test]
    fn unreadable_items_are_skipped_not_fatal() {
        let items = vec![
            Ok("web01"),
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
            Ok("db01"),
        ];
        assert_eq!(readable_items(Path::new("/backups"), items), vec!["web01", "db01"]);
    }

    #[test]
    fn sweep_walks_every_vm_root() {
        let tmp = tempfile::tempdir().unwrap();
        entry_with(&tmp.path().join("web01"), "backup-A", "success_compress");
        entry_with(&tmp.path().join("db01"), "backup-A", "success_compress");
        fs::write(tmp.path().join("status.log"), b"").unwrap();

        let report = compress_backup_dir(tmp.path(), 1).unwrap();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.files, 2);
    }
}
