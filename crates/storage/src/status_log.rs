use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Phase column of a status log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPhase {
    Run,
    VmExport,
    VdiExport,
}

impl StatusPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusPhase::Run => "vmbackup.py",
            StatusPhase::VmExport => "vm-export",
            StatusPhase::VdiExport => "vdi-export",
        }
    }
}

/// Append-only `<timestamp>,<phase>,<server>,<begin|end>[,<status>]` records.
#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
    server: String,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>, server: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            server: server.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin(&self, phase: StatusPhase, detail: Option<&str>) -> io::Result<()> {
        self.append(Local::now().naive_local(), phase, "begin", detail)
    }

    pub fn end(&self, phase: StatusPhase, status: &str) -> io::Result<()> {
        self.append(Local::now().naive_local(), phase, "end", Some(status))
    }

    pub fn append(
        &self,
        at: NaiveDateTime,
        phase: StatusPhase,
        edge: &str,
        status: Option<&str>,
    ) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format_record(at, phase, &self.server, edge, status).as_bytes())
    }
}

fn format_record(
    at: NaiveDateTime,
    phase: StatusPhase,
    server: &str,
    edge: &str,
    status: Option<&str>,
) -> String {
    let ts = at.format(TIMESTAMP_FORMAT);
    match status {
        Some(status) => format!("{ts},{},{server},{edge},{status}\n", phase.as_str()),
        None => format!("{ts},{},{server},{edge}\n", phase.as_str()),
    }
}
