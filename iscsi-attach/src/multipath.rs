//! dm-multipath detection and mapper resolution.
//!
//! Multipath is optional host infrastructure. A failing `multipath` command
//! means "not multipathed"; only a device that is confirmed multipathed but
//! whose mapper name cannot be determined is reported as an error.

use tracing::{debug, error, info, trace};

use crate::error::{IscsiError, Result};
use crate::executor::{CommandExecutor, LSBLK, MULTIPATH};
use crate::types::{Device, MAPPER_PREFIX};

/// Printed by `multipath -c` for a device it manages.
pub const VALID_MULTIPATH_MARKER: &str = "is a valid multipath device";

/// Whether dm-multipath manages `path`.
pub fn is_multipath(exec: &dyn CommandExecutor, path: &str) -> bool {
    match exec.run(MULTIPATH, &["-c", path]) {
        Ok(out) => {
            trace!(path = %path, output = %out, "multipath check output");
            out.contains(VALID_MULTIPATH_MARKER)
        }
        Err(e) => {
            debug!(path = %path, error = %e, "multipath check failed, multipath not running?");
            false
        }
    }
}

/// Parse `lsblk -n -o name -r` output: the first line is the device itself,
/// the second its holder.
pub fn parse_mapper_name(path: &str, output: &str) -> Result<String> {
    let lines: Vec<&str> = output.trim().lines().collect();
    match lines.get(1).map(|l| l.trim()) {
        Some(name) if !name.is_empty() => Ok(format!("{}{}", MAPPER_PREFIX, name)),
        _ => Err(IscsiError::MapperParseFailed {
            path: path.to_string(),
            reason: format!("expected at least 2 lines of lsblk output, got {:?}", lines),
        }),
    }
}

/// Mapper device that wraps the raw device at `path`.
pub fn resolve_mapper(exec: &dyn CommandExecutor, path: &str) -> Result<String> {
    let out = exec
        .run(LSBLK, &[path, "-n", "-o", "name", "-r"])
        .map_err(|e| {
            error!(path = %path, error = %e, "Unable to find mapper device due to lsblk error");
            IscsiError::MapperQueryFailed {
                path: path.to_string(),
                source: e,
            }
        })?;

    let mapper = parse_mapper_name(path, &out).inspect_err(|e| {
        error!(path = %path, error = %e, "Unable to parse lsblk output");
    })?;
    info!(path = %path, multipath = %mapper, "Device is multipathed, using mapper device");
    Ok(mapper)
}

/// Fill in `device.multipath_device` when its raw path is multipathed.
///
/// Returns the resolution error, if any, so callers can record it while
/// still using the raw path.
pub(crate) fn apply(exec: &dyn CommandExecutor, device: &mut Device) -> Option<IscsiError> {
    let path = device.path()?.to_string();
    if !is_multipath(exec, &path) {
        return None;
    }

    info!(path = %path, "Multipath detected");
    match resolve_mapper(exec, &path) {
        Ok(mapper) => {
            device.set_multipath_device(mapper);
            None
        }
        Err(e) => Some(e),
    }
}
