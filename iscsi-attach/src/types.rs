//! Devices, connection descriptors and portal addresses.
//!
//! A [`Device`] is built by the caller with its identity and connection
//! fields set and its paths empty. The attach and locate workflows fill in
//! `path`, and `multipath_device` when dm-multipath owns the raw device.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IscsiError, Result};

/// Default iSCSI port.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

/// Interface name used when none is given.
pub const DEFAULT_IFACE: &str = "default";

/// Prefix for dm-multipath mapper devices.
pub const MAPPER_PREFIX: &str = "/dev/mapper/";

/// Stable udev path for an iSCSI LUN.
///
/// The IQN and the `lun-` segment are joined without a separator; this is
/// how the attach workflow has always named the node and it must stay
/// byte-for-byte identical.
pub fn by_path_name(portal: &str, target_iqn: &str, lun: u32) -> String {
    format!("/dev/disk/by-path/ip-{}-iscsi-{}lun-{}", portal, target_iqn, lun)
}

// ============================================================================
// ChapCredentials
// ============================================================================

/// CHAP credentials configured on a node record before login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapCredentials {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Device
// ============================================================================

/// One attached or attachable iSCSI LUN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Device {
    pub target_iqn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    multipath_device: Option<String>,
    /// Target portal as `host:port`
    pub portal: String,
    /// open-iscsi interface binding
    pub iface: String,
    pub lun: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chap: Option<ChapCredentials>,
}

impl Device {
    /// Create an unattached device on the default interface.
    pub fn new(target_iqn: impl Into<String>, portal: impl Into<String>, lun: u32) -> Self {
        Self {
            target_iqn: target_iqn.into(),
            portal: portal.into(),
            iface: DEFAULT_IFACE.to_string(),
            lun,
            ..Default::default()
        }
    }

    /// Device carrying only a target identity, as produced by the locator.
    pub fn for_target(target_iqn: impl Into<String>) -> Self {
        Self {
            target_iqn: target_iqn.into(),
            ..Default::default()
        }
    }

    pub fn with_iface(mut self, iface: impl Into<String>) -> Self {
        self.iface = iface.into();
        self
    }

    pub fn with_chap(mut self, credentials: ChapCredentials) -> Self {
        self.chap = Some(credentials);
        self
    }

    pub fn use_chap(&self) -> bool {
        self.chap.is_some()
    }

    /// Raw device node, once resolved.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Mapper device, when dm-multipath owns the raw device.
    pub fn multipath_device(&self) -> Option<&str> {
        self.multipath_device.as_deref()
    }

    /// The path a consumer should open: the mapper device if there is one,
    /// otherwise the raw device.
    pub fn resolved_path(&self) -> Option<&str> {
        self.multipath_device().or_else(|| self.path())
    }

    /// Expected `/dev/disk/by-path` node for this device.
    pub fn expected_path(&self) -> String {
        by_path_name(&self.portal, &self.target_iqn, self.lun)
    }

    pub(crate) fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    /// Forget paths from an earlier attach so a failed one leaves none behind.
    pub(crate) fn clear_paths(&mut self) {
        self.path = None;
        self.multipath_device = None;
    }

    /// Ignored while `path` is unset: a mapper device always wraps a raw one.
    pub(crate) fn set_multipath_device(&mut self, mapper: impl Into<String>) {
        if self.path.is_some() {
            self.multipath_device = Some(mapper.into());
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Final state of a best-effort workflow.
///
/// Failures that the workflow tolerated are kept in `warnings`, in the order
/// they happened. The device's populated or empty paths remain the primary
/// result.
#[derive(Debug)]
pub struct Outcome {
    pub device: Device,
    pub warnings: Vec<IscsiError>,
}

impl Outcome {
    pub fn clean(device: Device) -> Self {
        Self {
            device,
            warnings: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Treat the first tolerated failure as fatal.
    pub fn into_strict(self) -> Result<Device> {
        match self.warnings.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.device),
        }
    }
}

// ============================================================================
// Portal
// ============================================================================

/// An iSCSI target portal (host:port).
///
/// The host can be an IP address (v4 or v6) or a hostname; no resolution is
/// attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub host: String,
    pub port: u16,
}

impl Portal {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(s: &str, default_port: u16) -> std::result::Result<Self, PortalParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PortalParseError(s.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let Some(bracket_end) = rest.find(']') else {
                return Err(PortalParseError(s.to_string()));
            };
            let host = &rest[..bracket_end];
            let tail = &rest[bracket_end + 1..];
            if host.is_empty() {
                return Err(PortalParseError(s.to_string()));
            }
            if tail.is_empty() {
                return Ok(Portal::new(host, default_port));
            }
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| PortalParseError(s.to_string()))?;
            return Ok(Portal::new(host, port));
        }

        // A bare IPv6 address like "fe80::1" has no unambiguous port, so the
        // last colon only splits off a port when exactly one colon is present.
        if s.matches(':').count() == 1
            && let Some((host, port)) = s.split_once(':')
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| PortalParseError(s.to_string()))?;
            if host.is_empty() {
                return Err(PortalParseError(s.to_string()));
            }
            return Ok(Portal::new(host, port));
        }

        Ok(Portal::new(s, default_port))
    }
}

impl Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Portal {
    type Err = PortalParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Portal::parse(s, DEFAULT_ISCSI_PORT)
    }
}

/// Error returned when parsing an invalid portal.
#[derive(Debug, Clone)]
pub struct PortalParseError(String);

impl Display for PortalParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid portal '{}': expected 'host:port' or 'host'", self.0)
    }
}

impl std::error::Error for PortalParseError {}

// ============================================================================
// Connection
// ============================================================================

/// Caller-facing connection descriptor.
///
/// A flat record as it arrives from configuration or a volume context. It
/// only feeds the attach workflow through [`Connection::to_device`].
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub target_iqn: String,
    /// `host` or `host:port`
    pub portal: String,
    /// Port used when `portal` has none
    pub port: Option<u16>,
    pub iface: String,
    pub lun: u32,
    /// Filesystem hint for whoever mounts the device
    pub fs_type: Option<String>,
    pub chap_enabled: bool,
    pub chap_login: String,
    #[serde(skip_serializing)]
    pub chap_password: String,
}

impl Connection {
    pub fn portal(&self) -> std::result::Result<Portal, PortalParseError> {
        Portal::parse(&self.portal, self.port.unwrap_or(DEFAULT_ISCSI_PORT))
    }

    /// Build the device the attach workflow operates on.
    pub fn to_device(&self) -> std::result::Result<Device, PortalParseError> {
        let portal = self.portal()?;
        let iface = if self.iface.is_empty() {
            DEFAULT_IFACE
        } else {
            &self.iface
        };

        let mut device = Device::new(&self.target_iqn, portal.to_string(), self.lun).with_iface(iface);
        if self.chap_enabled {
            device = device.with_chap(ChapCredentials::new(
                &self.chap_login,
                &self.chap_password,
            ));
        }
        Ok(device)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target_iqn", &self.target_iqn)
            .field("portal", &self.portal)
            .field("port", &self.port)
            .field("iface", &self.iface)
            .field("lun", &self.lun)
            .field("fs_type", &self.fs_type)
            .field("chap_enabled", &self.chap_enabled)
            .field("chap_login", &self.chap_login)
            .finish_non_exhaustive()
    }
}
