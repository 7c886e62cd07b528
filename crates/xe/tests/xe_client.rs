use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use vmbackup_xe::{CommandError, CommandOutput, CommandRunner, XeClient, XeConnection, XeError};

/// Replays canned outputs in order and records every invocation.
#[derive(Default)]
struct Replay {
    outputs: RefCell<VecDeque<CommandOutput>>,
    calls: RefCell<Vec<(PathBuf, Vec<String>)>>,
}

impl Replay {
    fn with(outputs: Vec<(i32, &str)>) -> Self {
        let replay = Self::default();
        for (code, text) in outputs {
            replay.outputs.borrow_mut().push_back(CommandOutput {
                code: Some(code),
                lines: text.lines().map(str::to_owned).collect(),
            });
        }
        replay
    }
}

impl CommandRunner for Replay {
    fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError> {
        self.calls
            .borrow_mut()
            .push((program.to_path_buf(), args.to_vec()));
        Ok(self.outputs.borrow_mut().pop_front().unwrap_or_default())
    }
}

#[test]
fn list_vm_names_parses_minimal_output() {
    let replay = Replay::with(vec![(0, "web01,db01,Windows Server")]);
    let xe = XeClient::new(&replay, XeConnection::default());

    let names = xe.list_vm_names().unwrap();
    assert_eq!(names, vec!["web01", "db01", "Windows Server"]);

    let calls = replay.calls.borrow();
    assert_eq!(calls[0].0, PathBuf::from("/opt/xensource/bin/xe"));
    assert_eq!(calls[0].1[0], "vm-list");
    assert!(calls[0].1.contains(&"is-a-snapshot=false".to_owned()));
}

#[test]
fn credentials_precede_subcommand() {
    let replay = Replay::with(vec![(0, "")]);
    let conn = XeConnection {
        xe_path: PathBuf::from("/usr/bin/xe"),
        server: Some("xen-master".into()),
        password: Some("pw".into()),
        ..XeConnection::default()
    };
    let xe = XeClient::new(&replay, conn);
    xe.vdi_destroy("vdi-1").unwrap();

    let calls = replay.calls.borrow();
    assert_eq!(
        calls[0].1,
        vec!["-s", "xen-master", "-u", "root", "-pw", "pw", "vdi-destroy", "uuid=vdi-1"]
    );
}

#[test]
fn snapshot_returns_last_line_uuid() {
    let replay = Replay::with(vec![(0, "\nsnap-uuid-1\n")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    assert_eq!(xe.vm_snapshot("vm-1", "RESTORE_web01").unwrap(), "snap-uuid-1");
}

#[test]
fn snapshot_without_output_is_an_error() {
    let replay = Replay::with(vec![(0, "")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    let err = xe.vm_snapshot("vm-1", "RESTORE_web01").unwrap_err();
    assert!(matches!(err, XeError::EmptyOutput { .. }));
}

#[test]
fn non_zero_exit_is_failed() {
    let replay = Replay::with(vec![(1, "The uuid you supplied was invalid.")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    let err = xe
        .vm_export("snap-1", Path::new("/backups/web01.xva"), true)
        .unwrap_err();
    assert!(matches!(err, XeError::Failed { code: Some(1), .. }));
    assert!(err.to_string().contains("vm-export"));

    let calls = replay.calls.borrow();
    assert!(calls[0].1.contains(&"compress=true".to_owned()));
    assert!(calls[0].1.contains(&"filename=/backups/web01.xva".to_owned()));
}

#[test]
fn xvda_disk_resolves_uuid_and_label() {
    let replay = Replay::with(vec![(0, "vdi-uuid-1"), (0, "web01 disk 0")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    let disk = xe.xvda_disk("vm-1").unwrap().expect("disk");
    assert_eq!(disk.uuid, "vdi-uuid-1");
    assert_eq!(disk.name_label, "web01 disk 0");
}

#[test]
fn xvda_disk_missing_is_none() {
    let replay = Replay::with(vec![(0, "")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    assert_eq!(xe.xvda_disk("vm-1").unwrap(), None);
    assert_eq!(replay.calls.borrow().len(), 1);
}

#[test]
fn pool_master_compares_uuids() {
    let replay = Replay::with(vec![(0, "host-a"), (0, "host-a")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    assert!(xe.is_pool_master("xen01").unwrap());

    let replay = Replay::with(vec![(0, "host-a"), (0, "host-b")]);
    let xe = XeClient::new(&replay, XeConnection::default());
    assert!(!xe.is_pool_master("xen02").unwrap());
}
