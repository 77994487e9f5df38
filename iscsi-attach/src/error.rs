use thiserror::Error;

use crate::executor::CommandError;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("initiator identity unavailable: {0}")]
    IdentityUnavailable(#[source] CommandError),

    #[error("iSCSI interface '{iface}' unavailable: {source}")]
    InterfaceUnavailable {
        iface: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to create node record for {target_iqn} at {portal}: {source}")]
    NodeCreateFailed {
        target_iqn: String,
        portal: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to set node.session.auth.{field} for {target_iqn}: {source}")]
    AuthConfigFailed {
        target_iqn: String,
        field: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("login to {target_iqn} at {portal} failed: {source}")]
    LoginFailed {
        target_iqn: String,
        portal: String,
        #[source]
        source: CommandError,
    },

    #[error("logout from {target_iqn} at {portal} failed: {source}")]
    LogoutFailed {
        target_iqn: String,
        portal: String,
        #[source]
        source: CommandError,
    },

    #[error("SCSI device query failed: {0}")]
    DeviceQueryFailed(#[source] CommandError),

    #[error("failed to query mapper device for {path}: {source}")]
    MapperQueryFailed {
        path: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to parse mapper device for {path}: {reason}")]
    MapperParseFailed { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, IscsiError>;
