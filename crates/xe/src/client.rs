use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::runner::{CommandError, CommandOutput, CommandRunner};

pub const DEFAULT_XE_PATH: &str = "/opt/xensource/bin/xe";

#[derive(Debug, Error)]
pub enum XeError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("xe {subcommand} failed (exit {})", code.map_or_else(|| "signal".to_owned(), |c| c.to_string()))]
    Failed {
        subcommand: String,
        code: Option<i32>,
    },
    #[error("xe {subcommand} returned no uuid")]
    EmptyOutput { subcommand: String },
}

/// Where and as whom `xe` connects. With no server, `xe` talks to the
/// local pool over its default socket.
#[derive(Debug, Clone)]
pub struct XeConnection {
    pub xe_path: PathBuf,
    pub server: Option<String>,
    pub username: String,
    pub password: Option<String>,
}

impl Default for XeConnection {
    fn default() -> Self {
        Self {
            xe_path: PathBuf::from(DEFAULT_XE_PATH),
            server: None,
            username: "root".to_owned(),
            password: None,
        }
    }
}

impl XeConnection {
    fn credential_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(server) = &self.server {
            args.push("-s".to_owned());
            args.push(server.clone());
        }
        if let Some(password) = &self.password {
            args.push("-u".to_owned());
            args.push(self.username.clone());
            args.push("-pw".to_owned());
            args.push(password.clone());
        }
        args
    }
}

/// The boot disk of a VM as seen by vdi-export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiInfo {
    pub uuid: String,
    pub name_label: String,
}

/// Thin typed wrapper over the `xe` subcommands a backup run needs.
pub struct XeClient<R> {
    runner: R,
    connection: XeConnection,
}

impl<R: CommandRunner> XeClient<R> {
    pub fn new(runner: R, connection: XeConnection) -> Self {
        Self { runner, connection }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs `xe <subcommand> <params...>` and returns its output whatever
    /// the exit status.
    pub fn call(&self, subcommand: &str, params: &[String]) -> Result<CommandOutput, XeError> {
        debug!(cmd = %format!("xe {subcommand} {}", params.join(" ")), "running xe");
        let mut args = self.connection.credential_args();
        args.push(subcommand.to_owned());
        args.extend(params.iter().cloned());
        Ok(self.runner.run(&self.connection.xe_path, &args)?)
    }

    fn call_ok(&self, subcommand: &str, params: &[String]) -> Result<CommandOutput, XeError> {
        let out = self.call(subcommand, params)?;
        if !out.success() {
            return Err(XeError::Failed {
                subcommand: subcommand.to_owned(),
                code: out.code,
            });
        }
        Ok(out)
    }

    fn call_uuid(&self, subcommand: &str, params: &[String]) -> Result<String, XeError> {
        let out = self.call_ok(subcommand, params)?;
        out.last_line()
            .map(str::to_owned)
            .ok_or_else(|| XeError::EmptyOutput {
                subcommand: subcommand.to_owned(),
            })
    }

    fn call_list(&self, subcommand: &str, params: &[String]) -> Result<Vec<String>, XeError> {
        let out = self.call_ok(subcommand, params)?;
        Ok(split_minimal(out.last_line().unwrap_or_default()))
    }

    /// Name labels of every non-control-domain, non-snapshot VM.
    pub fn list_vm_names(&self) -> Result<Vec<String>, XeError> {
        self.call_list(
            "vm-list",
            &params(&[
                "is-control-domain=false",
                "is-a-snapshot=false",
                "params=name-label",
                "--minimal",
            ]),
        )
    }

    /// UUIDs of non-snapshot VMs carrying `name`.
    pub fn vm_uuids_by_name(&self, name: &str) -> Result<Vec<String>, XeError> {
        self.call_list(
            "vm-list",
            &[
                format!("name-label={name}"),
                "is-a-snapshot=false".to_owned(),
                "params=uuid".to_owned(),
                "--minimal".to_owned(),
            ],
        )
    }

    /// UUIDs of any VM record, snapshots included, carrying `name`.
    pub fn any_vm_uuids_by_name(&self, name: &str) -> Result<Vec<String>, XeError> {
        self.call_list(
            "vm-list",
            &[
                format!("name-label={name}"),
                "params=uuid".to_owned(),
                "--minimal".to_owned(),
            ],
        )
    }

    pub fn vm_power_state(&self, vm_uuid: &str) -> Result<String, XeError> {
        let out = self.call_ok(
            "vm-list",
            &[
                format!("uuid={vm_uuid}"),
                "params=power-state".to_owned(),
                "--minimal".to_owned(),
            ],
        )?;
        Ok(out.last_line().unwrap_or_default().to_owned())
    }

    pub fn vm_export_metadata(&self, vm_uuid: &str, filename: &Path) -> Result<(), XeError> {
        self.call_ok(
            "vm-export",
            &[
                "metadata=true".to_owned(),
                format!("uuid={vm_uuid}"),
                format!("filename={}", filename.display()),
            ],
        )
        .map(drop)
    }

    pub fn vm_snapshot(&self, vm_uuid: &str, new_name_label: &str) -> Result<String, XeError> {
        self.call_uuid(
            "vm-snapshot",
            &[
                format!("vm={vm_uuid}"),
                format!("new-name-label={new_name_label}"),
            ],
        )
    }

    /// Turns a snapshot into something `vm-export` accepts.
    pub fn make_exportable(&self, snapshot_uuid: &str) -> Result<(), XeError> {
        self.call_ok(
            "template-param-set",
            &[
                "is-a-template=false".to_owned(),
                "ha-always-run=false".to_owned(),
                format!("uuid={snapshot_uuid}"),
            ],
        )
        .map(drop)
    }

    pub fn vm_export(&self, uuid: &str, filename: &Path, compress: bool) -> Result<(), XeError> {
        let mut args = vec![
            format!("uuid={uuid}"),
            format!("filename={}", filename.display()),
        ];
        if compress {
            args.push("compress=true".to_owned());
        }
        self.call_ok("vm-export", &args).map(drop)
    }

    pub fn vm_uninstall(&self, uuid: &str) -> Result<(), XeError> {
        self.call_ok(
            "vm-uninstall",
            &[format!("uuid={uuid}"), "force=true".to_owned()],
        )
        .map(drop)
    }

    /// The VDI plugged as `xvda`, if the VM has one.
    pub fn xvda_disk(&self, vm_uuid: &str) -> Result<Option<VdiInfo>, XeError> {
        let vdis = self.call_list(
            "vbd-list",
            &[
                format!("vm-uuid={vm_uuid}"),
                "device=xvda".to_owned(),
                "type=Disk".to_owned(),
                "params=vdi-uuid".to_owned(),
                "--minimal".to_owned(),
            ],
        )?;
        let Some(uuid) = vdis.into_iter().next() else {
            return Ok(None);
        };
        let out = self.call_ok(
            "vdi-list",
            &[
                format!("uuid={uuid}"),
                "params=name-label".to_owned(),
                "--minimal".to_owned(),
            ],
        )?;
        let name_label = out.last_line().unwrap_or_default().to_owned();
        if name_label.is_empty() {
            return Ok(None);
        }
        Ok(Some(VdiInfo { uuid, name_label }))
    }

    pub fn vdi_list(&self, vdi_uuid: &str) -> Result<(), XeError> {
        self.call_ok("vdi-list", &[format!("uuid={vdi_uuid}")]).map(drop)
    }

    pub fn vdi_uuids_by_name(&self, name_label: &str) -> Result<Vec<String>, XeError> {
        self.call_list(
            "vdi-list",
            &[
                format!("name-label={name_label}"),
                "params=uuid".to_owned(),
                "--minimal".to_owned(),
            ],
        )
    }

    pub fn vdi_snapshot(&self, vdi_uuid: &str) -> Result<String, XeError> {
        self.call_uuid("vdi-snapshot", &[format!("uuid={vdi_uuid}")])
    }

    pub fn vdi_set_name_label(&self, vdi_uuid: &str, name_label: &str) -> Result<(), XeError> {
        self.call_ok(
            "vdi-param-set",
            &[format!("uuid={vdi_uuid}"), format!("name-label={name_label}")],
        )
        .map(drop)
    }

    pub fn vdi_export(&self, vdi_uuid: &str, format: &str, filename: &Path) -> Result<(), XeError> {
        self.call_ok(
            "vdi-export",
            &[
                format!("format={format}"),
                format!("uuid={vdi_uuid}"),
                format!("filename={}", filename.display()),
            ],
        )
        .map(drop)
    }

    pub fn vdi_destroy(&self, vdi_uuid: &str) -> Result<(), XeError> {
        self.call_ok("vdi-destroy", &[format!("uuid={vdi_uuid}")])
            .map(drop)
    }

    /// True when `hostname` is the pool master.
    pub fn is_pool_master(&self, hostname: &str) -> Result<bool, XeError> {
        let master = self.call_ok("pool-list", &params(&["params=master", "--minimal"]))?;
        let host = self.call_ok(
            "host-list",
            &[format!("name-label={hostname}"), "--minimal".to_owned()],
        )?;
        Ok(matches!(
            (master.last_line(), host.last_line()),
            (Some(m), Some(h)) if m == h
        ))
    }

    pub fn pool_dump_database(&self, file: &Path) -> Result<(), XeError> {
        self.call_ok(
            "pool-dump-database",
            &[format!("file-name={}", file.display())],
        )
        .map(drop)
    }
}

fn params(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

/// Splits `--minimal` output (`a,b,c`) into values.
pub fn split_minimal(line: &str) -> Vec<String> {
    line.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
