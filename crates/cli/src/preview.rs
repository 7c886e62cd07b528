use std::collections::BTreeSet;

use anyhow::{bail, Result};
use tracing::{info, warn};
use vmbackup_xe::{CommandRunner, XeClient, XeError};

use crate::config::Selection;

/// Inventory names shared by more than one non-snapshot VM, sorted.
///
/// Every VM on the host is checked, not only the selected ones.
pub fn duplicate_vm_names<R: CommandRunner>(
    xe: &XeClient<R>,
    inventory: &[String],
) -> Result<Vec<String>, XeError> {
    let mut duplicates = Vec::new();
    for name in inventory.iter().collect::<BTreeSet<_>>() {
        let uuids = xe.vm_uuids_by_name(name)?;
        if uuids.len() > 1 {
            warn!(vm = %name, uuids = %uuids.join(", "), "duplicate VM name");
            duplicates.push(name.clone());
        }
    }
    Ok(duplicates)
}

/// Validates the host inventory and the selection without touching any VM.
pub fn preview<R: CommandRunner>(
    xe: &XeClient<R>,
    inventory: &[String],
    selection: &Selection,
) -> Result<()> {
    info!(count = inventory.len(), "checking all VMs for duplicate names");
    let duplicates = duplicate_vm_names(xe, inventory)?;
    if !duplicates.is_empty() {
        bail!("duplicate VM names: {}", duplicates.join(", "));
    }
    if !selection.warnings.is_empty() {
        warn!(patterns = %selection.warnings.join(", "), "patterns matched no VM");
    }
    info!(targets = selection.ordered().len(), "preview ok");
    Ok(())
}
