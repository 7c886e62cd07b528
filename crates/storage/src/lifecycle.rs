use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use tracing::{info, warn};
use vmbackup_core::{entry_dir_name, BackupEntry, BackupOutcome, MarkerState};

use crate::error::{LifecycleError, Result};

/// The on-disk history of backup attempts for one VM: `<backup_dir>/<vm_name>/`.
///
/// No state is cached between calls. Every operation re-derives the entry
/// list from the directory, so a run interrupted at any point leaves a tree
/// the next run can inspect and clean.
#[derive(Debug, Clone)]
pub struct BackupRoot {
    root: PathBuf,
}

impl BackupRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_vm(backup_dir: &Path, vm_name: &str) -> Self {
        Self::new(backup_dir.join(vm_name))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root_exists(&self) -> Result<()> {
        if self.root.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|source| LifecycleError::DirectoryCreate {
            path: self.root.clone(),
            source,
        })?;
        info!(root = %self.root.display(), "created vm backup root");
        Ok(())
    }

    /// Entry names in ascending (oldest first) order.
    pub fn entry_names(&self) -> Result<Vec<String>> {
        let list_err = |source| LifecycleError::List {
            path: self.root.clone(),
            source,
        };
        let mut names = Vec::new();
        for item in fs::read_dir(&self.root).map_err(list_err)? {
            let item = item.map_err(list_err)?;
            names.push(item.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn entries(&self) -> Result<Vec<BackupEntry>> {
        Ok(self
            .entry_names()?
            .into_iter()
            .map(|name| {
                let state = self.marker_state(&name);
                BackupEntry::new(name, state)
            })
            .collect())
    }

    pub fn marker_state(&self, entry_name: &str) -> MarkerState {
        let dir = self.root.join(entry_name);
        MarkerState::SUCCESSFUL
            .into_iter()
            .find(|state| {
                state
                    .file_name()
                    .is_some_and(|file| dir.join(file).exists())
            })
            .unwrap_or(MarkerState::Unmarked)
    }

    /// Deletes the newest entry when it carries no success marker.
    ///
    /// Only the newest entry is inspected, and a root with a single entry is
    /// left alone even if that entry is unmarked.
    pub fn reclaim_failed_attempt(&self) -> Result<Option<String>> {
        let names = self.entry_names()?;
        if names.len() <= 1 {
            return Ok(None);
        }
        let Some(newest) = names.last() else {
            return Ok(None);
        };
        if self.marker_state(newest).is_successful() {
            return Ok(None);
        }
        info!(entry = %newest, root = %self.root.display(), "deleting last unsuccessful backup");
        self.remove_entry(newest)?;
        Ok(Some(newest.clone()))
    }

    pub fn create_new_entry(&self) -> Result<PathBuf> {
        self.create_new_entry_at(Local::now().naive_local())
    }

    /// Fails if an entry with the same timestamp already exists.
    pub fn create_new_entry_at(&self, at: NaiveDateTime) -> Result<PathBuf> {
        let path = self.root.join(entry_dir_name(at));
        fs::create_dir(&path).map_err(|source| LifecycleError::DirectoryCreate {
            path: path.clone(),
            source,
        })?;
        info!(entry = %path.display(), "new backup entry");
        Ok(path)
    }

    /// Writes the zero-byte marker for an export of `size_bytes`.
    pub fn mark_outcome(&self, entry_path: &Path, size_bytes: u64) -> Result<MarkerState> {
        let marker = BackupOutcome::for_size(size_bytes).marker();
        write_marker(entry_path, marker)?;
        if marker == MarkerState::SuccessCompressed {
            info!(entry = %entry_path.display(), size_bytes, "large export marked for compression");
        }
        Ok(marker)
    }

    /// Deletes the oldest entries until at most `max_backups` remain, never
    /// deleting the last one. Returns the removed names, oldest first.
    pub fn prune_oldest(&self, max_backups: u32) -> Result<Vec<String>> {
        let limit = max_backups as usize;
        let mut removed = Vec::new();
        loop {
            let names = match self.entry_names() {
                Ok(names) => names,
                Err(err) => return Err(prune_stopped(removed, err)),
            };
            if names.len() <= limit || names.len() <= 1 {
                return Ok(removed);
            }
            let oldest = &names[0];
            info!(entry = %oldest, root = %self.root.display(), "deleting oldest backup");
            if let Err(err) = self.remove_entry(oldest) {
                return Err(prune_stopped(removed, err));
            }
            removed.push(oldest.clone());
        }
    }

    /// False for an empty root or when any entry lacks every success marker.
    pub fn all_entries_successful(&self) -> Result<bool> {
        let entries = self.entries()?;
        if entries.is_empty() {
            return Ok(false);
        }
        match entries.iter().find(|entry| !entry.is_successful()) {
            Some(entry) => {
                warn!(entry = %entry, root = %self.root.display(), "backup entry not successful");
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn remove_entry(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|source| LifecycleError::Remove { path, source })
    }
}

pub(crate) fn write_marker(entry_path: &Path, marker: MarkerState) -> Result<()> {
    let Some(file) = marker.file_name() else {
        return Ok(());
    };
    let path = entry_path.join(file);
    fs::write(&path, b"").map_err(|source| LifecycleError::Marker { path, source })
}

fn prune_stopped(removed: Vec<String>, source: LifecycleError) -> LifecycleError {
    LifecycleError::Prune {
        removed,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .and_then(|d| d.and_hms_opt(7, 9, sec))
            .expect("valid timestamp")
    }

    fn seed(root: &BackupRoot, names: &[(&str, Option<&str>)]) {
        for (name, marker) in names {
            let dir = root.path().join(name);
            fs::create_dir_all(&dir).expect("create entry");
            fs::write(dir.join("vm.xva"), b"payload").expect("payload");
            if let Some(marker) = marker {
                fs::write(dir.join(marker), b"").expect("marker");
            }
        }
    }

    #[test]
    fn ensure_root_creates_missing_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::for_vm(tmp.path(), "web01");
        assert!(!root.path().exists());
        root.ensure_root_exists().expect("create");
        assert!(root.path().is_dir());
        root.ensure_root_exists().expect("idempotent");
    }

    #[test]
    fn ensure_root_fails_when_parent_is_a_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"").expect("file");
        let root = BackupRoot::new(blocker.join("web01"));
        let err = root.ensure_root_exists().unwrap_err();
        assert!(matches!(err, LifecycleError::DirectoryCreate { .. }));
    }

    #[test]
    fn reclaim_ignores_root_with_zero_or_one_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        assert_eq!(root.reclaim_failed_attempt().expect("empty"), None);

        seed(&root, &[("backup-X", None)]);
        assert_eq!(root.reclaim_failed_attempt().expect("single"), None);
        assert!(root.path().join("backup-X").exists());
    }

    #[test]
    fn reclaim_deletes_only_unmarked_newest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        seed(
            &root,
            &[
                ("backup-A", Some("success")),
                ("backup-B", None),
                ("backup-C", None),
            ],
        );
        assert_eq!(
            root.reclaim_failed_attempt().expect("reclaim"),
            Some("backup-C".to_owned())
        );
        assert_eq!(root.entry_names().unwrap(), vec!["backup-A", "backup-B"]);
    }

    #[test]
    fn reclaim_keeps_newest_with_any_success_marker() {
        for state in MarkerState::SUCCESSFUL {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = BackupRoot::new(tmp.path());
            seed(
                &root,
                &[("backup-A", Some("success")), ("backup-B", state.file_name())],
            );
            assert_eq!(root.reclaim_failed_attempt().expect("reclaim"), None);
            assert_eq!(root.entry_names().unwrap().len(), 2);
        }
    }

    #[test]
    fn create_new_entry_uses_timestamp_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        let path = root.create_new_entry_at(at(5, 2)).expect("create");
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("backup-2024-03-05-(07:09:02)")
        );
        assert_eq!(root.marker_state("backup-2024-03-05-(07:09:02)"), MarkerState::Unmarked);
    }

    #[test]
    fn create_new_entry_refuses_collision() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        root.create_new_entry_at(at(5, 2)).expect("first");
        let err = root.create_new_entry_at(at(5, 2)).unwrap_err();
        assert!(matches!(err, LifecycleError::DirectoryCreate { .. }));
    }

    #[test]
    fn mark_outcome_picks_marker_by_size() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        let small = root.create_new_entry_at(at(5, 1)).expect("small");
        let large = root.create_new_entry_at(at(5, 2)).expect("large");

        let marker = root.mark_outcome(&small, 1024).expect("mark small");
        assert_eq!(marker, MarkerState::Success);
        assert_eq!(fs::metadata(small.join("success")).unwrap().len(), 0);

        let marker = root
            .mark_outcome(&large, vmbackup_core::COMPRESS_THRESHOLD_BYTES + 1)
            .expect("mark large");
        assert_eq!(marker, MarkerState::SuccessCompressed);
        assert!(large.join("success_compress").exists());
        assert!(!large.join("success").exists());
    }

    #[test]
    fn prune_removes_oldest_down_to_limit() {
        for policy in 1..=6u32 {
            for count in 0..=6usize {
                let tmp = tempfile::tempdir().expect("tempdir");
                let root = BackupRoot::new(tmp.path());
                let names: Vec<String> = (0..count).map(|i| format!("backup-{i:02}")).collect();
                let seeded: Vec<(&str, Option<&str>)> =
                    names.iter().map(|n| (n.as_str(), Some("success"))).collect();
                seed(&root, &seeded);

                let removed = root.prune_oldest(policy).expect("prune");
                let remaining = root.entry_names().expect("list");
                let expected_len = count.min(policy as usize);
                assert_eq!(remaining.len(), expected_len, "policy {policy} count {count}");
                assert_eq!(removed, names[..count - expected_len].to_vec());
                assert_eq!(remaining, names[count - expected_len..].to_vec());
            }
        }
    }

    #[test]
    fn prune_never_removes_the_last_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        seed(&root, &[("backup-A", Some("success")), ("backup-B", None)]);
        let removed = root.prune_oldest(0).expect("prune");
        assert_eq!(removed, vec!["backup-A"]);
        assert_eq!(root.entry_names().unwrap(), vec!["backup-B"]);
    }

    #[test]
    fn prune_reports_list_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path().join("missing"));
        let err = root.prune_oldest(2).unwrap_err();
        match err {
            LifecycleError::Prune { removed, .. } => assert!(removed.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Whether a read-only directory actually stops deletion here. It does
    /// not for root, which bypasses permission checks.
    #[cfg(unix)]
    fn read_only_dirs_enforced(scratch: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        let dir = scratch.join("perm-check");
        fs::create_dir_all(&dir).expect("create check dir");
        fs::write(dir.join("file"), b"").expect("write check file");
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555)).expect("chmod");
        let blocked = fs::remove_file(dir.join("file")).is_err();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).expect("chmod back");
        fs::remove_dir_all(&dir).expect("remove check dir");
        blocked
    }

    #[cfg(unix)]
    #[test]
    fn prune_stops_on_delete_failure_and_keeps_progress() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        if !read_only_dirs_enforced(tmp.path()) {
            eprintln!("skipping: permissions are not enforced for this user");
            return;
        }
        let root = BackupRoot::new(tmp.path().join("web01"));
        seed(
            &root,
            &[
                ("backup-A", Some("success")),
                ("backup-B", Some("success")),
                ("backup-C", Some("success")),
            ],
        );
        let locked = root.path().join("backup-B").join("disks");
        fs::create_dir(&locked).expect("create locked dir");
        fs::write(locked.join("xvda.vhd"), b"disk").expect("payload");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).expect("chmod");

        let result = root.prune_oldest(1);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod back");

        match result {
            Err(LifecycleError::Prune { removed, source }) => {
                assert_eq!(removed, vec!["backup-A"]);
                assert!(matches!(*source, LifecycleError::Remove { .. }), "{source}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(
            root.entry_names().expect("list"),
            vec!["backup-B", "backup-C"]
        );
        assert!(!root.path().join("backup-A").exists());
    }

    #[test]
    fn all_entries_successful_checks_every_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        assert!(!root.all_entries_successful().expect("empty"));

        seed(
            &root,
            &[
                ("backup-A", Some("success")),
                ("backup-B", Some("success_restore")),
                ("backup-C", Some("success_compressing")),
            ],
        );
        assert!(root.all_entries_successful().expect("all marked"));

        seed(&root, &[("backup-D", None)]);
        assert!(!root.all_entries_successful().expect("one unmarked"));
    }

    #[test]
    fn scenario_reclaim_then_prune() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = BackupRoot::new(tmp.path());
        seed(
            &root,
            &[
                ("backup-A", Some("success")),
                ("backup-B", Some("success")),
                ("backup-C", None),
            ],
        );

        assert_eq!(
            root.reclaim_failed_attempt().unwrap(),
            Some("backup-C".to_owned())
        );

        let new_entry = root.path().join("backup-D");
        fs::create_dir(&new_entry).unwrap();
        root.mark_outcome(&new_entry, 10).unwrap();

        let removed = root.prune_oldest(2).unwrap();
        assert_eq!(removed, vec!["backup-A"]);
        assert_eq!(root.entry_names().unwrap(), vec!["backup-B", "backup-D"]);
        assert!(root.all_entries_successful().unwrap());
    }

    #[test]
    fn rerun_after_crash_converges() {
        // Interrupt before the new entry is marked, then run again.
        for crash_after in 0..3 {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = BackupRoot::new(tmp.path());
            seed(
                &root,
                &[
                    ("backup-2024-03-01-(07:09:00)", Some("success")),
                    ("backup-2024-03-02-(07:09:00)", Some("success")),
                ],
            );

            root.reclaim_failed_attempt().unwrap();
            if crash_after >= 1 {
                let entry = root.create_new_entry_at(at(3, 0)).unwrap();
                if crash_after >= 2 {
                    fs::write(entry.join("vm.xva"), b"partial").unwrap();
                }
            }

            root.reclaim_failed_attempt().unwrap();
            let entry = root.create_new_entry_at(at(4, 0)).unwrap();
            root.mark_outcome(&entry, 10).unwrap();
            root.prune_oldest(2).unwrap();

            assert_eq!(
                root.entry_names().unwrap(),
                vec!["backup-2024-03-02-(07:09:00)", "backup-2024-03-04-(07:09:00)"],
                "crash after step {crash_after}"
            );
            assert!(root.all_entries_successful().unwrap());
        }
    }
}
