//! Drives one backup run: the prologue checks, the optional pool database
//! dump, then every selected VM in order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use thiserror::Error;
use tracing::{error, info, warn};
use vmbackup_core::{
    pool_dump_file_name, ExportMode, RunSummary, TargetStatus, VmBackupTarget,
};
use vmbackup_storage::{BackupRoot, LifecycleError, StatusLog, StatusPhase};
use vmbackup_xe::{CommandRunner, XeClient, XeError};

use crate::config::Settings;
use crate::host::short_host_name;

pub const WRITE_TEST_FILE: &str = "00VMbackupWriteTest";
pub const METADATA_FILE: &str = "vm-metadata.xva";

/// Whole minutes and whole GiB, as existing status log readers expect.
const GIB: u64 = 1 << 30;

/// Reasons a single target stops. Each maps to the code written to the
/// status log.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("no VM named {0:?}")]
    NotFound(String),
    #[error("{count} VMs share the name {name:?}")]
    Ambiguous { name: String, count: usize },
    #[error("backup directory")]
    Directory(#[from] LifecycleError),
    #[error("vm has no xvda disk")]
    NoXvda,
    #[error("{code}")]
    Xe {
        code: &'static str,
        #[source]
        source: XeError,
    },
    #[error("export file {}", path.display())]
    ExportFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TargetError {
    pub fn code(&self) -> &'static str {
        match self {
            TargetError::NotFound(_) | TargetError::Ambiguous { .. } => "ERROR verify_vm_name",
            TargetError::Directory(_) => "ERROR backup_dir",
            TargetError::NoXvda => "ERROR xvda-uuid not found",
            TargetError::Xe { code, .. } => *code,
            TargetError::ExportFile { .. } => "ERROR export file",
        }
    }
}

fn xe_step(code: &'static str) -> impl FnOnce(XeError) -> TargetError {
    move |source| TargetError::Xe { code, source }
}

/// Per-invocation switches from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub compress: bool,
    pub pre_clean: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetReport {
    pub vm_name: String,
    pub export_mode: ExportMode,
    pub status: TargetStatus,
    pub size_bytes: Option<u64>,
    pub elapsed: Duration,
    /// Status-log code, set when the target failed.
    pub error: Option<String>,
}

impl TargetReport {
    /// The status field of the target's `end` record.
    pub fn status_line(&self) -> String {
        match &self.error {
            Some(code) => format!("{code} {}", self.vm_name),
            None => format!(
                "{} {},elapse:{} size:{}G",
                self.status,
                self.vm_name,
                self.elapsed.as_secs() / 60,
                self.size_bytes.unwrap_or_default() / GIB
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub summary: RunSummary,
    pub targets: Vec<TargetReport>,
}

pub struct Orchestrator<R> {
    xe: XeClient<R>,
    settings: Settings,
    options: RunOptions,
    hostname: String,
    status_log: Option<StatusLog>,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(xe: XeClient<R>, settings: Settings, options: RunOptions, hostname: &str) -> Self {
        Self {
            xe,
            settings,
            options,
            hostname: hostname.to_owned(),
            status_log: None,
        }
    }

    pub fn with_status_log(mut self, status_log: StatusLog) -> Self {
        self.status_log = Some(status_log);
        self
    }

    /// Host name without the domain part, as written to the status log.
    pub fn server_name(&self) -> &str {
        short_host_name(&self.hostname)
    }

    /// Backs up `targets` in order. Only a failure that makes the whole run
    /// pointless (an unwritable backup_dir) is returned as an error;
    /// per-target failures are counted in the summary.
    pub fn run(&self, targets: &[VmBackupTarget]) -> Result<RunReport> {
        self.status_begin(StatusPhase::Run, None);
        info!(server = self.server_name(), targets = targets.len(), "VmBackup running");

        self.check_backup_dir_writable()?;
        self.log_disk_space("space before backups");

        let mut report = RunReport::default();
        if self.settings.pool_db_backup {
            if let Err(err) = self.backup_pool_metadata() {
                error!(error = ?err, "pool database backup failed");
                report.summary.record(TargetStatus::Error);
            }
        }

        for target in targets {
            let result = self.backup_target(target);
            report.summary.record(result.status);
            report.targets.push(result);
        }

        self.log_disk_space("space remaining");
        let status = report.summary.status();
        self.status_end(StatusPhase::Run, &format!("{status},{}", report.summary));
        info!(status = %status, summary = %report.summary, "VmBackup done");
        Ok(report)
    }

    fn check_backup_dir_writable(&self) -> Result<()> {
        let test_file = self.settings.backup_dir.join(WRITE_TEST_FILE);
        fs::write(&test_file, b"")
            .and_then(|()| fs::remove_file(&test_file))
            .with_context(|| format!("backup_dir {:?} is not writable", self.settings.backup_dir))
    }

    fn log_disk_space(&self, label: &str) {
        let args = ["-Th".to_owned(), self.settings.backup_dir.display().to_string()];
        match self.xe.runner().run(Path::new("df"), &args) {
            Ok(out) => info!(label, lines = out.lines.len(), "df -Th"),
            Err(err) => warn!(label, error = %err, "df unavailable"),
        }
    }

    fn backup_pool_metadata(&self) -> Result<()> {
        if !self.xe.is_pool_master(&self.hostname)? {
            info!(host = %self.hostname, "not the pool master, skipping pool database backup");
            return Ok(());
        }
        let dir = self
            .settings
            .backup_dir
            .join(format!("METADATA_{}", self.server_name()));
        fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;
        let file = dir.join(pool_dump_file_name(Local::now().naive_local()));
        self.xe
            .pool_dump_database(&file)
            .with_context(|| format!("dumping pool database to {file:?}"))?;
        info!(file = %file.display(), "pool database saved");
        Ok(())
    }

    /// Runs every step for one VM and reports its outcome. Never fails: a
    /// fatal-for-target error becomes an `Error` report.
    pub fn backup_target(&self, target: &VmBackupTarget) -> TargetReport {
        let phase = match target.export_mode {
            ExportMode::VmExport => StatusPhase::VmExport,
            ExportMode::VdiExport => StatusPhase::VdiExport,
        };
        self.status_begin(phase, Some(&target.vm_name));
        info!(vm = %target.vm_name, mode = %target.export_mode, "backup begin");

        let started = Instant::now();
        let mut status = TargetStatus::Success;
        let outcome = self.try_backup(target, &mut status);
        let mut report = TargetReport {
            vm_name: target.vm_name.clone(),
            export_mode: target.export_mode,
            status,
            size_bytes: None,
            elapsed: started.elapsed(),
            error: None,
        };
        match outcome {
            Ok(size) => {
                report.size_bytes = Some(size);
                info!(
                    vm = %target.vm_name,
                    status = %report.status,
                    minutes = report.elapsed.as_secs() / 60,
                    size_bytes = size,
                    "backup end"
                );
            }
            Err(err) => {
                let code = err.code();
                error!(vm = %target.vm_name, code, error = ?anyhow::Error::from(err), "backup failed");
                report.status = TargetStatus::Error;
                report.error = Some(code.to_owned());
            }
        }
        self.status_end(phase, &report.status_line());
        report
    }

    fn try_backup(
        &self,
        target: &VmBackupTarget,
        status: &mut TargetStatus,
    ) -> Result<u64, TargetError> {
        let vm = target.vm_name.as_str();
        let retention = target.retention(self.settings.retention);
        let vm_uuid = self.verify_vm_name(vm)?;

        let root = BackupRoot::for_vm(&self.settings.backup_dir, vm);
        root.ensure_root_exists()?;
        if let Some(reclaimed) = root.reclaim_failed_attempt()? {
            info!(vm, entry = %reclaimed, "removed unfinished backup");
        }
        let entry = root.create_new_entry()?;
        info!(vm, entry = %entry.display(), "created backup entry");

        if let Err(err) = self.xe.vm_export_metadata(&vm_uuid, &entry.join(METADATA_FILE)) {
            warn!(vm, error = %err, "vm metadata export failed");
            status.warn();
        }
        match self.xe.vm_power_state(&vm_uuid) {
            Ok(state) => info!(vm, power_state = %state, "vm state"),
            Err(err) => warn!(vm, error = %err, "could not read power state"),
        }

        let max_backups = retention.max_backups();
        let export_file = match target.export_mode {
            ExportMode::VmExport => {
                self.export_vm(vm, &vm_uuid, &root, &entry, max_backups, status)?
            }
            ExportMode::VdiExport => {
                self.export_vdi(vm, &vm_uuid, &root, &entry, max_backups, status)?
            }
        };

        let size = fs::metadata(&export_file)
            .map_err(|source| TargetError::ExportFile {
                path: export_file.clone(),
                source,
            })?
            .len();
        let marker = root.mark_outcome(&entry, size)?;
        info!(vm, marker = ?marker, size_bytes = size, "backup entry marked");

        match root.prune_oldest(retention.max_backups()) {
            Ok(removed) if !removed.is_empty() => info!(vm, ?removed, "pruned old backups"),
            Ok(_) => {}
            Err(err) => {
                warn!(vm, error = ?anyhow::Error::from(err), "pruning old backups failed");
                status.warn();
            }
        }
        match root.all_entries_successful() {
            Ok(true) => {}
            Ok(false) => {
                warn!(vm, "cleanup needed, not all backup history is successful");
                status.warn();
            }
            Err(err) => {
                warn!(vm, error = %err, "could not check backup history");
                status.warn();
            }
        }
        Ok(size)
    }

    fn verify_vm_name(&self, vm: &str) -> Result<String, TargetError> {
        let mut uuids = self
            .xe
            .vm_uuids_by_name(vm)
            .map_err(xe_step("ERROR verify_vm_name"))?;
        match uuids.len() {
            0 => Err(TargetError::NotFound(vm.to_owned())),
            1 => Ok(uuids.remove(0)),
            count => Err(TargetError::Ambiguous {
                name: vm.to_owned(),
                count,
            }),
        }
    }

    /// Deletes older entries while the new one is still unmarked, so the
    /// history never holds more than `max_backups - 1` old entries during
    /// the export.
    fn pre_clean(&self, vm: &str, root: &BackupRoot, max_backups: u32, status: &mut TargetStatus) {
        if !self.options.pre_clean || max_backups <= 1 {
            return;
        }
        match root.prune_oldest(max_backups) {
            Ok(removed) => info!(vm, ?removed, "pre_clean"),
            Err(err) => {
                warn!(vm, error = ?anyhow::Error::from(err), "pre_clean failed");
                status.warn();
            }
        }
    }

    /// Full VM export into `entry`. Returns the export file path.
    fn export_vm(
        &self,
        vm: &str,
        vm_uuid: &str,
        root: &BackupRoot,
        entry: &Path,
        max_backups: u32,
        status: &mut TargetStatus,
    ) -> Result<PathBuf, TargetError> {
        let snap_name = format!("RESTORE_{vm}");
        match self.xe.any_vm_uuids_by_name(&snap_name) {
            Ok(stale) => {
                for uuid in stale {
                    info!(vm, snapshot = %uuid, "removing old {snap_name}");
                    if let Err(err) = self.xe.vm_uninstall(&uuid) {
                        warn!(vm, error = %err, "could not remove old snapshot");
                        status.warn();
                    }
                }
            }
            Err(err) => {
                warn!(vm, error = %err, "could not look up old snapshots");
                status.warn();
            }
        }

        self.pre_clean(vm, root, max_backups, status);

        let snap_uuid = self
            .xe
            .vm_snapshot(vm_uuid, &snap_name)
            .map_err(xe_step("SNAPSHOT-FAIL"))?;
        self.xe
            .make_exportable(&snap_uuid)
            .map_err(xe_step("TEMPLATE-PARAM-SET-FAIL"))?;

        let export_file = if self.options.compress {
            entry.join(format!("{vm}.xva.gz"))
        } else {
            entry.join(format!("{vm}.xva"))
        };
        self.xe
            .vm_export(&snap_uuid, &export_file, self.options.compress)
            .map_err(xe_step("VM-EXPORT-FAIL"))?;

        if let Err(err) = self.xe.vm_uninstall(&snap_uuid) {
            warn!(vm, snapshot = %snap_uuid, error = %err, "snapshot cleanup failed");
            status.warn();
        }
        Ok(export_file)
    }

    /// Boot disk export into `entry`. Returns the export file path.
    fn export_vdi(
        &self,
        vm: &str,
        vm_uuid: &str,
        root: &BackupRoot,
        entry: &Path,
        max_backups: u32,
        status: &mut TargetStatus,
    ) -> Result<PathBuf, TargetError> {
        let disk = self
            .xe
            .xvda_disk(vm_uuid)
            .map_err(xe_step("VDI-LIST-FAIL"))?
            .ok_or(TargetError::NoXvda)?;
        self.xe
            .vdi_list(&disk.uuid)
            .map_err(xe_step("VDI-LIST-FAIL"))?;

        let snap_name = format!("SNAP_{vm}_{}", disk.name_label.replace(' ', "-"));
        match self.xe.vdi_uuids_by_name(&snap_name) {
            Ok(stale) => {
                for uuid in stale {
                    info!(vm, vdi = %uuid, "removing old {snap_name}");
                    if let Err(err) = self.xe.vdi_destroy(&uuid) {
                        warn!(vm, error = %err, "could not remove old vdi snapshot");
                        status.warn();
                    }
                }
            }
            Err(err) => {
                warn!(vm, error = %err, "could not look up old vdi snapshots");
                status.warn();
            }
        }

        self.pre_clean(vm, root, max_backups, status);

        let snap_uuid = self
            .xe
            .vdi_snapshot(&disk.uuid)
            .map_err(xe_step("VDI-SNAPSHOT-FAIL"))?;
        self.xe
            .vdi_set_name_label(&snap_uuid, &snap_name)
            .map_err(xe_step("VDI-PARAM-SET-FAIL"))?;

        let format = self.settings.vdi_export_format;
        let export_file = entry.join(format!("{vm}.{}", format.as_str()));
        let exported = self
            .xe
            .vdi_export(&snap_uuid, format.as_str(), &export_file)
            .map_err(xe_step("VDI-EXPORT-FAIL"));

        // The snapshot is dropped even when the export failed.
        if let Err(err) = self.xe.vdi_destroy(&snap_uuid) {
            warn!(vm, vdi = %snap_uuid, error = %err, "vdi snapshot cleanup failed");
            status.warn();
        }
        exported?;
        Ok(export_file)
    }

    fn status_begin(&self, phase: StatusPhase, detail: Option<&str>) {
        if let Some(log) = &self.status_log {
            if let Err(err) = log.begin(phase, detail) {
                warn!(path = %log.path().display(), error = %err, "status log write failed");
            }
        }
    }

    fn status_end(&self, phase: StatusPhase, status: &str) {
        if let Some(log) = &self.status_log {
            if let Err(err) = log.end(phase, status) {
                warn!(path = %log.path().display(), error = %err, "status log write failed");
            }
        }
    }
}
