//! iSCSI session establishment via open-iscsi node records.
//!
//! CHAP setup is a sequence of independent `iscsiadm --op=update` calls on
//! the node record. A failure part way through leaves the earlier updates
//! in place; nothing is rolled back.

use tracing::{debug, error, info, instrument, warn};

use crate::error::{IscsiError, Result};
use crate::executor::{CommandError, CommandExecutor, ISCSIADM};

/// Node record settings written for CHAP, in the order they are applied.
pub const AUTH_METHOD_FIELD: &str = "authmethod";
pub const AUTH_USERNAME_FIELD: &str = "username";
pub const AUTH_PASSWORD_FIELD: &str = "password";

fn node_args<'a>(target_iqn: &'a str, portal: &'a str) -> Vec<&'a str> {
    vec!["-m", "node", "-T", target_iqn, "-p", portal]
}

/// Log in to a target without configuring credentials.
///
/// Uses whatever node record exists for the target/portal pair, or lets
/// `iscsiadm` create one implicitly.
#[instrument(skip(exec))]
pub fn login(exec: &dyn CommandExecutor, target_iqn: &str, portal: &str, iface: &str) -> Result<()> {
    let mut args = node_args(target_iqn, portal);
    args.push("--login");
    debug!(args = ?args, "Attempting iSCSI login");

    exec.run(ISCSIADM, &args).map_err(|e| {
        error!(target_iqn = %target_iqn, portal = %portal, error = %e, "iscsiadm login failed");
        IscsiError::LoginFailed {
            target_iqn: target_iqn.to_string(),
            portal: portal.to_string(),
            source: e,
        }
    })?;

    info!(target_iqn = %target_iqn, portal = %portal, "iSCSI login successful");
    Ok(())
}

/// Create a node record bound to `iface`, configure CHAP on it and log in.
///
/// Every step is a separate `iscsiadm` invocation and the first failure
/// ends the sequence.
#[instrument(skip(exec, password))]
pub fn login_with_chap(
    exec: &dyn CommandExecutor,
    target_iqn: &str,
    portal: &str,
    username: &str,
    password: &str,
    iface: &str,
) -> Result<()> {
    let mut create_args = node_args(target_iqn, portal);
    create_args.extend(["--interface", iface, "--op", "new"]);
    exec.run(ISCSIADM, &create_args).map_err(|e| {
        error!(target_iqn = %target_iqn, portal = %portal, error = %e, "Failed to create node record");
        IscsiError::NodeCreateFailed {
            target_iqn: target_iqn.to_string(),
            portal: portal.to_string(),
            source: e,
        }
    })?;
    debug!(target_iqn = %target_iqn, portal = %portal, iface = %iface, "Node record created");

    for (field, value) in [
        (AUTH_METHOD_FIELD, "CHAP"),
        (AUTH_USERNAME_FIELD, username),
        (AUTH_PASSWORD_FIELD, password),
    ] {
        update_auth(exec, target_iqn, portal, field, value)?;
    }

    let mut login_args = node_args(target_iqn, portal);
    login_args.push("--login");
    exec.run(ISCSIADM, &login_args).map_err(|e| {
        error!(target_iqn = %target_iqn, portal = %portal, error = %e, "iscsiadm login failed");
        IscsiError::LoginFailed {
            target_iqn: target_iqn.to_string(),
            portal: portal.to_string(),
            source: e,
        }
    })?;

    info!(target_iqn = %target_iqn, portal = %portal, "iSCSI CHAP login successful");
    Ok(())
}

fn update_auth(
    exec: &dyn CommandExecutor,
    target_iqn: &str,
    portal: &str,
    field: &'static str,
    value: &str,
) -> Result<()> {
    let name = format!("node.session.auth.{}", field);
    let value_arg = format!("--value={}", value);
    let mut args = node_args(target_iqn, portal);
    args.extend(["--op=update", "--name", name.as_str(), value_arg.as_str()]);

    exec.run(ISCSIADM, &args).map_err(|e| {
        error!(
            target_iqn = %target_iqn,
            field = %field,
            output = e.output().unwrap_or_default(),
            "Failed to update node auth setting"
        );
        IscsiError::AuthConfigFailed {
            target_iqn: target_iqn.to_string(),
            field,
            source: e,
        }
    })?;
    Ok(())
}

/// Log out of a target.
///
/// Logging out of a target that has no session is not an error.
#[instrument(skip(exec))]
pub fn logout(exec: &dyn CommandExecutor, target_iqn: &str, portal: &str) -> Result<()> {
    let mut args = node_args(target_iqn, portal);
    args.push("--logout");

    match exec.run(ISCSIADM, &args) {
        Ok(_) => {
            info!(target_iqn = %target_iqn, portal = %portal, "iSCSI logout successful");
            Ok(())
        }
        Err(e) if is_not_logged_in(&e) => {
            warn!(target_iqn = %target_iqn, portal = %portal, "iSCSI target was not logged in");
            Ok(())
        }
        Err(e) => {
            error!(target_iqn = %target_iqn, portal = %portal, error = %e, "iscsiadm logout failed");
            Err(IscsiError::LogoutFailed {
                target_iqn: target_iqn.to_string(),
                portal: portal.to_string(),
                source: e,
            })
        }
    }
}

fn is_not_logged_in(err: &CommandError) -> bool {
    err.output()
        .is_some_and(|out| out.contains("No matching sessions") || out.contains("not logged in"))
}
