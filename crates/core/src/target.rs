use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_BACKUPS: u32 = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExportMode {
    VmExport,
    VdiExport,
}

impl ExportMode {
    /// Config key and status-log phase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ExportMode::VmExport => "vm-export",
            ExportMode::VdiExport => "vdi-export",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VdiExportFormat {
    #[default]
    Raw,
    Vhd,
}

impl VdiExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            VdiExportFormat::Raw => "raw",
            VdiExportFormat::Vhd => "vhd",
        }
    }
}

impl FromStr for VdiExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(VdiExportFormat::Raw),
            "vhd" => Ok(VdiExportFormat::Vhd),
            other => Err(format!("expected raw or vhd, got {other:?}")),
        }
    }
}

/// Maximum number of backup entries kept per VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_backups: u32,
}

impl RetentionPolicy {
    /// Returns `None` for zero; a policy always keeps at least one entry.
    pub fn new(max_backups: u32) -> Option<Self> {
        (max_backups >= 1).then_some(Self { max_backups })
    }

    pub fn max_backups(&self) -> u32 {
        self.max_backups
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

/// A resolved VM to back up. `vm_name` is always a concrete inventory name
/// here; pattern expansion happens while resolving the config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmBackupTarget {
    pub vm_name: String,
    pub export_mode: ExportMode,
    /// Per-target `name:N` override.
    pub max_backups: Option<RetentionPolicy>,
}

impl VmBackupTarget {
    pub fn new(vm_name: impl Into<String>, export_mode: ExportMode) -> Self {
        Self {
            vm_name: vm_name.into(),
            export_mode,
            max_backups: None,
        }
    }

    pub fn with_max_backups(mut self, policy: RetentionPolicy) -> Self {
        self.max_backups = Some(policy);
        self
    }

    pub fn retention(&self, default: RetentionPolicy) -> RetentionPolicy {
        self.max_backups.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_rejects_zero() {
        assert!(RetentionPolicy::new(0).is_none());
        assert_eq!(RetentionPolicy::new(1).map(|p| p.max_backups()), Some(1));
    }

    #[test]
    fn target_override_wins_over_default() {
        let default = RetentionPolicy::default();
        let plain = VmBackupTarget::new("web01", ExportMode::VmExport);
        assert_eq!(plain.retention(default).max_backups(), DEFAULT_MAX_BACKUPS);

        let overridden = plain.with_max_backups(RetentionPolicy::new(2).unwrap());
        assert_eq!(overridden.retention(default).max_backups(), 2);
    }

    #[test]
    fn vdi_format_parses_known_values() {
        assert_eq!("raw".parse(), Ok(VdiExportFormat::Raw));
        assert_eq!("vhd".parse(), Ok(VdiExportFormat::Vhd));
        assert!("qcow2".parse::<VdiExportFormat>().is_err());
    }
}
