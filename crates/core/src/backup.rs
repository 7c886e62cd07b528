use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// strftime pattern for backup entry directories. Fixed width so that the
/// lexicographic order of names equals their chronological order.
pub const ENTRY_NAME_FORMAT: &str = "backup-%Y-%m-%d-(%H:%M:%S)";

/// Exports larger than this are marked for out-of-band compression.
pub const COMPRESS_THRESHOLD_BYTES: u64 = 60 * 1024 * 1024 * 1024;

/// Outcome recorded for a backup entry, as persisted by its marker file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MarkerState {
    Success,
    SuccessCompressed,
    SuccessRestore,
    SuccessCompressing,
    Unmarked,
}

impl MarkerState {
    /// Marker states that count as a successful backup, in detection order.
    pub const SUCCESSFUL: [MarkerState; 4] = [
        MarkerState::Success,
        MarkerState::SuccessCompressed,
        MarkerState::SuccessRestore,
        MarkerState::SuccessCompressing,
    ];

    /// Zero-byte sentinel file name, or `None` for `Unmarked`.
    pub fn file_name(self) -> Option<&'static str> {
        match self {
            MarkerState::Success => Some("success"),
            MarkerState::SuccessCompressed => Some("success_compress"),
            MarkerState::SuccessRestore => Some("success_restore"),
            MarkerState::SuccessCompressing => Some("success_compressing"),
            MarkerState::Unmarked => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::SUCCESSFUL
            .into_iter()
            .find(|state| state.file_name() == Some(name))
    }

    pub fn is_successful(self) -> bool {
        !matches!(self, MarkerState::Unmarked)
    }
}

/// Result of a completed export, before it is translated to a marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Completed,
    CompressionPending,
}

impl BackupOutcome {
    pub fn for_size(size_bytes: u64) -> Self {
        if size_bytes <= COMPRESS_THRESHOLD_BYTES {
            BackupOutcome::Completed
        } else {
            BackupOutcome::CompressionPending
        }
    }

    pub fn marker(self) -> MarkerState {
        match self {
            BackupOutcome::Completed => MarkerState::Success,
            BackupOutcome::CompressionPending => MarkerState::SuccessCompressed,
        }
    }
}

/// One timestamped backup attempt inside a VM backup root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupEntry {
    pub directory_name: String,
    pub marker_state: MarkerState,
}

impl BackupEntry {
    pub fn new(directory_name: impl Into<String>, marker_state: MarkerState) -> Self {
        Self {
            directory_name: directory_name.into(),
            marker_state,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.marker_state.is_successful()
    }
}

impl fmt::Display for BackupEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.directory_name)
    }
}

/// Directory name for a backup started at `at`, e.g. `backup-2024-03-05-(07:09:02)`.
pub fn entry_dir_name(at: NaiveDateTime) -> String {
    at.format(ENTRY_NAME_FORMAT).to_string()
}

/// File name for a pool database dump taken at `at`.
pub fn pool_dump_file_name(at: NaiveDateTime) -> String {
    at.format("pool_db_%Y%m%d-%H%M%S.dump").to_string()
}
