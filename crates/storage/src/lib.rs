pub mod compress;
pub mod error;
mod lifecycle;
pub mod status_log;

pub use compress::{compress_backup_dir, compress_pending, CompressReport};
pub use error::LifecycleError;
pub use lifecycle::BackupRoot;
pub use status_log::{StatusLog, StatusPhase};
