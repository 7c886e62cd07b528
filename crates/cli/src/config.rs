use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};
use vmbackup_core::{ExportMode, RetentionPolicy, VdiExportFormat, VmBackupTarget};

pub const DEFAULT_BACKUP_DIR: &str = "/snapshots/BACKUPS";
pub const DEFAULT_STATUS_LOG: &str = "/snapshots/NAUbackup/status.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: expected key=value, got {text:?}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: unexpected config key {key:?} (consider ignore_extra_keys=true)")]
    UnknownKey { line: usize, key: String },
    #[error("line {line}: {key} given more than once")]
    DuplicateKey { line: usize, key: &'static str },
    #[error("{key}: invalid value {value:?}, {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}={value}: backup count must be a positive integer")]
    InvalidBackupCount { key: &'static str, value: String },
    #[error("{key}={value}: invalid regex")]
    InvalidRegex {
        key: &'static str,
        value: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid vm selector {0:?}, expected NAME, vm-export=NAME or vdi-export=NAME")]
    InvalidSelector(String),
    #[error("backup_dir does not exist: {}", .0.display())]
    MissingBackupDir(PathBuf),
    #[error("no VMs selected for backup")]
    NoTargets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    PoolDbBackup,
    MaxBackups,
    BackupDir,
    VdiExportFormat,
    StatusLog,
    VmExport,
    VdiExport,
    Exclude,
}

impl Key {
    const ALL: [Key; 8] = [
        Key::PoolDbBackup,
        Key::MaxBackups,
        Key::BackupDir,
        Key::VdiExportFormat,
        Key::StatusLog,
        Key::VmExport,
        Key::VdiExport,
        Key::Exclude,
    ];

    fn name(self) -> &'static str {
        match self {
            Key::PoolDbBackup => "pool_db_backup",
            Key::MaxBackups => "max_backups",
            Key::BackupDir => "backup_dir",
            Key::VdiExportFormat => "vdi_export_format",
            Key::StatusLog => "status_log",
            Key::VmExport => "vm-export",
            Key::VdiExport => "vdi-export",
            Key::Exclude => "exclude",
        }
    }

    fn lookup(name: &str) -> Option<Key> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }
}

/// One `vm-export=`/`vdi-export=` value: a VM name or regex with an
/// optional `:N` retention override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub pattern: String,
    pub max_backups: Option<RetentionPolicy>,
}

impl ExportEntry {
    fn parse(key: &'static str, value: &str) -> Result<Self, ConfigError> {
        let Some((pattern, count)) = value.rsplit_once(':') else {
            return Ok(Self {
                pattern: value.to_owned(),
                max_backups: None,
            });
        };
        let policy = count
            .trim()
            .parse::<u32>()
            .ok()
            .and_then(RetentionPolicy::new)
            .ok_or_else(|| ConfigError::InvalidBackupCount {
                key,
                value: value.to_owned(),
            })?;
        Ok(Self {
            pattern: pattern.to_owned(),
            max_backups: Some(policy),
        })
    }
}

/// Typed contents of a config file. Scalars are `None` when absent; the
/// repeatable keys keep file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub pool_db_backup: Option<bool>,
    pub max_backups: Option<RetentionPolicy>,
    pub backup_dir: Option<PathBuf>,
    pub vdi_export_format: Option<VdiExportFormat>,
    pub status_log: Option<PathBuf>,
    pub vm_export: Vec<ExportEntry>,
    pub vdi_export: Vec<ExportEntry>,
    pub exclude: Vec<String>,
}

impl ConfigFile {
    pub fn parse(text: &str, ignore_extra_keys: bool) -> Result<Self, ConfigError> {
        let mut cfg = ConfigFile::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line,
                    text: trimmed.to_owned(),
                });
            };
            let (key, value) = (key.trim(), value.trim());
            let Some(known) = Key::lookup(key) else {
                if ignore_extra_keys {
                    info!(key, "ignoring config key");
                    continue;
                }
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.to_owned(),
                });
            };
            cfg.set(known, value, line)?;
        }
        Ok(cfg)
    }

    /// Builds a config from a command-line VM selector: `NAME`,
    /// `vm-export=NAME` or `vdi-export=NAME`.
    pub fn from_selector(selector: &str) -> Result<Self, ConfigError> {
        let (key, value) = match selector.split_once('=') {
            Some((key, value)) if !value.contains('=') => (key.trim(), value.trim()),
            Some(_) => return Err(ConfigError::InvalidSelector(selector.to_owned())),
            None => (Key::VmExport.name(), selector),
        };
        let key = match Key::lookup(key) {
            Some(key @ (Key::VmExport | Key::VdiExport)) => key,
            _ => return Err(ConfigError::InvalidSelector(selector.to_owned())),
        };
        let mut cfg = ConfigFile::default();
        cfg.set(key, value, 1)?;
        Ok(cfg)
    }

    fn set(&mut self, key: Key, value: &str, line: usize) -> Result<(), ConfigError> {
        let name = key.name();
        let duplicate = || ConfigError::DuplicateKey { line, key: name };
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: name,
            value: value.to_owned(),
            reason: reason.to_owned(),
        };
        match key {
            Key::PoolDbBackup => {
                let flag = match value {
                    "0" => false,
                    "1" => true,
                    _ => return Err(invalid("expected 0 or 1")),
                };
                replace_once(&mut self.pool_db_backup, flag).ok_or_else(duplicate)
            }
            Key::MaxBackups => {
                let policy = value
                    .parse::<u32>()
                    .ok()
                    .and_then(RetentionPolicy::new)
                    .ok_or_else(|| invalid("expected a positive integer"))?;
                replace_once(&mut self.max_backups, policy).ok_or_else(duplicate)
            }
            Key::BackupDir => {
                replace_once(&mut self.backup_dir, PathBuf::from(value)).ok_or_else(duplicate)
            }
            Key::VdiExportFormat => {
                let format = value.parse::<VdiExportFormat>().map_err(|e| invalid(&e))?;
                replace_once(&mut self.vdi_export_format, format).ok_or_else(duplicate)
            }
            Key::StatusLog => {
                replace_once(&mut self.status_log, PathBuf::from(value)).ok_or_else(duplicate)
            }
            Key::VmExport => {
                self.vm_export.push(ExportEntry::parse(name, value)?);
                Ok(())
            }
            Key::VdiExport => {
                // An empty vdi-export would otherwise select every VM.
                if !value.is_empty() {
                    self.vdi_export.push(ExportEntry::parse(name, value)?);
                }
                Ok(())
            }
            Key::Exclude => {
                if !value.is_empty() {
                    self.exclude.push(value.to_owned());
                }
                Ok(())
            }
        }
    }
}

fn replace_once<T>(slot: &mut Option<T>, value: T) -> Option<()> {
    if slot.is_some() {
        return None;
    }
    *slot = Some(value);
    Some(())
}

pub fn load_config(path: &Path, ignore_extra_keys: bool) -> Result<ConfigFile> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    ConfigFile::parse(&contents, ignore_extra_keys)
        .with_context(|| format!("parsing config file {path:?}"))
}

/// Scalar settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub pool_db_backup: bool,
    pub retention: RetentionPolicy,
    pub backup_dir: PathBuf,
    pub vdi_export_format: VdiExportFormat,
    pub status_log: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_db_backup: false,
            retention: RetentionPolicy::default(),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            vdi_export_format: VdiExportFormat::default(),
            status_log: PathBuf::from(DEFAULT_STATUS_LOG),
        }
    }
}

impl Settings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let defaults = Settings::default();
        Self {
            pool_db_backup: cfg.pool_db_backup.unwrap_or(defaults.pool_db_backup),
            retention: cfg.max_backups.unwrap_or(defaults.retention),
            backup_dir: cfg.backup_dir.clone().unwrap_or(defaults.backup_dir),
            vdi_export_format: cfg.vdi_export_format.unwrap_or(defaults.vdi_export_format),
            status_log: cfg.status_log.clone().unwrap_or(defaults.status_log),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backup_dir.is_dir() {
            return Err(ConfigError::MissingBackupDir(self.backup_dir.clone()));
        }
        Ok(())
    }

    pub fn log(&self) {
        info!(
            backup_dir = %self.backup_dir.display(),
            status_log = %self.status_log.display(),
            max_backups = self.retention.max_backups(),
            vdi_export_format = self.vdi_export_format.as_str(),
            pool_db_backup = self.pool_db_backup,
            "settings"
        );
    }
}

/// Literal VM name or start-anchored regex, as written in the config.
#[derive(Debug, Clone)]
enum NameMatcher {
    Literal(String),
    Pattern(Regex),
}

impl NameMatcher {
    fn parse(key: &'static str, value: &str) -> Result<Self, ConfigError> {
        if is_plain_vm_name(value) {
            return Ok(NameMatcher::Literal(value.to_owned()));
        }
        Regex::new(&format!("^(?:{value})"))
            .map(NameMatcher::Pattern)
            .map_err(|source| ConfigError::InvalidRegex {
                key,
                value: value.to_owned(),
                source,
            })
    }

    fn matches(&self, vm_name: &str) -> bool {
        match self {
            NameMatcher::Literal(name) => name == vm_name,
            NameMatcher::Pattern(re) => re.is_match(vm_name),
        }
    }
}

/// Word characters, whitespace and dashes only, e.g. `PRD-test 123`.
fn is_plain_vm_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c.is_whitespace())
}

/// VM targets resolved against the live inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub vdi_export: Vec<VmBackupTarget>,
    pub vm_export: Vec<VmBackupTarget>,
    pub excluded: Vec<String>,
    /// Patterns that matched nothing.
    pub warnings: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.vdi_export.is_empty() && self.vm_export.is_empty()
    }

    /// Processing order: every vdi-export target, then every vm-export target.
    pub fn ordered(&self) -> Vec<VmBackupTarget> {
        self.vdi_export
            .iter()
            .chain(self.vm_export.iter())
            .cloned()
            .collect()
    }

    pub fn log(&self) {
        let names = |targets: &[VmBackupTarget]| {
            targets
                .iter()
                .map(|t| match t.max_backups {
                    Some(policy) => format!("{}:{}", t.vm_name, policy.max_backups()),
                    None => t.vm_name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        info!(count = self.excluded.len(), vms = %self.excluded.join(", "), "exclude");
        info!(count = self.vdi_export.len(), vms = %names(&self.vdi_export), "vdi-export");
        info!(count = self.vm_export.len(), vms = %names(&self.vm_export), "vm-export");
    }
}

pub fn resolve_targets(cfg: &ConfigFile, inventory: &[String]) -> Result<Selection, ConfigError> {
    let mut selection = Selection::default();

    for value in &cfg.exclude {
        let matcher = NameMatcher::parse(Key::Exclude.name(), value)?;
        let hits: Vec<&String> = inventory.iter().filter(|vm| matcher.matches(vm)).collect();
        if hits.is_empty() {
            warn!(exclude = %value, "vm not found");
            selection.warnings.push(format!("exclude={value}"));
        }
        for vm in hits {
            if !selection.excluded.contains(vm) {
                selection.excluded.push(vm.clone());
            }
        }
    }

    let available: Vec<&String> = inventory
        .iter()
        .filter(|vm| !selection.excluded.contains(vm))
        .collect();

    let vdi_export = expand(
        Key::VdiExport,
        ExportMode::VdiExport,
        &cfg.vdi_export,
        &available,
        &[],
        &mut selection.warnings,
    )?;
    let vm_export = expand(
        Key::VmExport,
        ExportMode::VmExport,
        &cfg.vm_export,
        &available,
        &vdi_export,
        &mut selection.warnings,
    )?;
    selection.vdi_export = vdi_export;
    selection.vm_export = vm_export;

    if selection.is_empty() {
        return Err(ConfigError::NoTargets);
    }
    Ok(selection)
}

fn expand(
    key: Key,
    mode: ExportMode,
    entries: &[ExportEntry],
    available: &[&String],
    taken: &[VmBackupTarget],
    warnings: &mut Vec<String>,
) -> Result<Vec<VmBackupTarget>, ConfigError> {
    let mut targets: Vec<VmBackupTarget> = Vec::new();
    for entry in entries {
        let matcher = NameMatcher::parse(key.name(), &entry.pattern)?;
        let mut found = false;
        for vm in available.iter().filter(|vm| matcher.matches(vm)) {
            found = true;
            if taken.iter().any(|t| t.vm_name == vm.as_str()) {
                continue;
            }
            let mut target = VmBackupTarget::new(vm.as_str(), mode);
            target.max_backups = entry.max_backups;
            // A later entry for the same VM keeps the first position but
            // replaces the override.
            match targets.iter_mut().find(|t| t.vm_name == target.vm_name) {
                Some(existing) => *existing = target,
                None => targets.push(target),
            }
        }
        if !found {
            warn!(key = key.name(), pattern = %entry.pattern, "vm not found");
            warnings.push(format!("{}={}", key.name(), entry.pattern));
        }
    }
    Ok(targets)
}
