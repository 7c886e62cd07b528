use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Parser;
use vmbackup_xe::DEFAULT_XE_PATH;

use crate::notify::DEFAULT_SENDMAIL;

const CONFIG_HELP: &str = "\
Config file (one key=value per line, # starts a comment):
  pool_db_backup=0|1          dump the pool database first (pool master only)
  max_backups=4               entries kept per VM
  backup_dir=/snapshots/BACKUPS
  vdi_export_format=raw|vhd
  status_log=/snapshots/NAUbackup/status.log
  vm-export=NAME[:N]          full VM export; NAME may be a regex
  vdi-export=NAME[:N]         boot disk export
  exclude=NAME                never back up matching VMs

Instead of a config file, CONFIG may name VMs directly:
  NAME, vm-export=NAME or vdi-export=NAME";

/// XenServer VM backups with per-VM retention.
#[derive(Debug, Parser)]
#[command(name = "vmbackup", version, after_help = CONFIG_HELP)]
pub struct Cli {
    /// xe password, or a file holding it base64 encoded
    pub password: String,

    /// Config file, VM selector, or create-password-file=PATH
    pub config: String,

    /// preview, compress=BOOL, ignore_extra_keys=BOOL, pre_clean=BOOL
    #[arg(value_parser = parse_run_flag)]
    pub options: Vec<RunFlag>,

    #[arg(long, env = "VMBACKUP_XE_PATH", default_value = DEFAULT_XE_PATH)]
    pub xe_path: PathBuf,

    /// Remote pool master; the local pool when unset
    #[arg(long, env = "VMBACKUP_XE_SERVER")]
    pub xe_server: Option<String>,

    #[arg(long, env = "VMBACKUP_XE_USER", default_value = "root")]
    pub xe_user: String,

    /// Mail the status log here after the run
    #[arg(long, env = "VMBACKUP_MAIL_TO")]
    pub mail_to: Option<String>,

    #[arg(long, env = "VMBACKUP_MAIL_FROM")]
    pub mail_from: Option<String>,

    #[arg(long, env = "VMBACKUP_SENDMAIL", default_value = DEFAULT_SENDMAIL)]
    pub sendmail: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFlag {
    Preview,
    Compress(bool),
    IgnoreExtraKeys(bool),
    PreClean(bool),
}

fn parse_run_flag(token: &str) -> Result<RunFlag, String> {
    if token.eq_ignore_ascii_case("preview") {
        return Ok(RunFlag::Preview);
    }
    let Some((key, value)) = token.split_once('=') else {
        return Err(format!("unknown option {token:?}"));
    };
    let value = value.eq_ignore_ascii_case("true");
    match key.to_ascii_lowercase().as_str() {
        "compress" => Ok(RunFlag::Compress(value)),
        "ignore_extra_keys" => Ok(RunFlag::IgnoreExtraKeys(value)),
        "pre_clean" => Ok(RunFlag::PreClean(value)),
        _ => Err(format!("unknown option {token:?}")),
    }
}

/// Folded run flags; a later token wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub preview: bool,
    pub compress: bool,
    pub ignore_extra_keys: bool,
    pub pre_clean: bool,
}

impl Flags {
    pub fn from_tokens(tokens: &[RunFlag]) -> Self {
        let mut flags = Flags::default();
        for token in tokens {
            match *token {
                RunFlag::Preview => flags.preview = true,
                RunFlag::Compress(on) => flags.compress = on,
                RunFlag::IgnoreExtraKeys(on) => flags.ignore_extra_keys = on,
                RunFlag::PreClean(on) => flags.pre_clean = on,
            }
        }
        flags
    }
}

impl Cli {
    pub fn flags(&self) -> Flags {
        Flags::from_tokens(&self.options)
    }

    /// Target path of `create-password-file=PATH`, if that was asked for.
    pub fn password_file_request(&self) -> Option<PathBuf> {
        self.config
            .strip_prefix("create-password-file=")
            .map(PathBuf::from)
    }
}

/// The literal password, or the decoded contents when `arg` names a file.
pub fn resolve_password(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    if !path.is_file() {
        return Ok(arg.to_owned());
    }
    let encoded =
        fs::read_to_string(path).with_context(|| format!("reading password file {path:?}"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .with_context(|| format!("password file {path:?} is not base64"))?;
    String::from_utf8(decoded).with_context(|| format!("password file {path:?} is not utf-8"))
}

pub fn write_password_file(path: &Path, password: &str) -> Result<()> {
    fs::write(path, STANDARD.encode(password))
        .with_context(|| format!("writing password file {path:?}"))
}
