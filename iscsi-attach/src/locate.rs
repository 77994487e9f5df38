//! Finding the block device of an attached target in the SCSI device table.

use tracing::{error, info, instrument};

use crate::error::{IscsiError, Result};
use crate::executor::{CommandExecutor, LSSCSI};
use crate::metrics::OperationTimer;
use crate::multipath;
use crate::types::{Device, Outcome};

/// Device path for `target_iqn` in `lsscsi -t` output.
///
/// Every row mentioning the IQN is considered and the last one wins. The
/// device path is the row's final column.
pub fn parse_device_table(output: &str, target_iqn: &str) -> Option<String> {
    let mut found = None;
    for row in output.trim().lines() {
        if row.contains(target_iqn)
            && let Some(path) = row.split_whitespace().next_back()
        {
            found = Some(path);
        }
    }
    found.map(str::to_string)
}

/// Look up the device currently attached for `target_iqn`.
///
/// No matching row is not an error: the returned device simply has no
/// path. When a row matches, multipath resolution runs on the raw path and
/// any mapper failure is carried as a warning.
#[instrument(skip(exec))]
pub fn locate(exec: &dyn CommandExecutor, target_iqn: &str) -> Result<Outcome> {
    let timer = OperationTimer::new("locate");

    let out = match exec.run(LSSCSI, &["-t"]) {
        Ok(out) => out,
        Err(e) => {
            error!(error = %e, "Unable to perform lsscsi -t");
            timer.failure("device_query_failed");
            return Err(IscsiError::DeviceQueryFailed(e));
        }
    };

    let mut outcome = Outcome::clean(Device::for_target(target_iqn));
    let Some(path) = parse_device_table(&out, target_iqn) else {
        info!(target_iqn = %target_iqn, "No SCSI device found for target");
        timer.success();
        return Ok(outcome);
    };

    info!(target_iqn = %target_iqn, path = %path, "Found SCSI device");
    outcome.device.set_path(path);
    if let Some(warning) = multipath::apply(exec, &mut outcome.device) {
        outcome.warnings.push(warning);
    }

    timer.success();
    Ok(outcome)
}
