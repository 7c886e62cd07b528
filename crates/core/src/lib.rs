pub mod backup;
pub mod summary;
pub mod target;

pub use backup::{
    entry_dir_name, pool_dump_file_name, BackupEntry, BackupOutcome, MarkerState,
    COMPRESS_THRESHOLD_BYTES, ENTRY_NAME_FORMAT,
};
pub use summary::{RunSummary, TargetStatus};
pub use target::{ExportMode, RetentionPolicy, VdiExportFormat, VmBackupTarget, DEFAULT_MAX_BACKUPS};
