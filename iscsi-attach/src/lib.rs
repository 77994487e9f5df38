//! iSCSI Device Attach Library
//!
//! Initiator-side attachment of iSCSI LUNs on Linux using the open-iscsi
//! tools, with optional dm-multipath resolution.
//!
//! This library provides:
//! - Initiator identity lookup (`/etc/iscsi/initiatorname.iscsi`)
//! - Node record setup, CHAP configuration, login and logout via `iscsiadm`
//! - Polling for the udev `/dev/disk/by-path` node of a LUN
//! - Device lookup through `lsscsi` and mapper resolution through `multipath`/`lsblk`
//! - An idempotent attach workflow tying these together
//!
//! All host interaction goes through [`CommandExecutor`] and [`PathProbe`],
//! so every workflow can run against scripted fakes.
//!
//! ```ignore
//! use iscsi_attach::{AttachConfig, Attacher, Device, FsProbe, SystemExecutor};
//!
//! let attacher = Attacher::new(SystemExecutor, FsProbe, AttachConfig::default());
//! let outcome = attacher.attach(Device::new("iqn.2010-01.com.example:vol1", "10.0.0.1:3260", 0))?;
//! if let Some(path) = outcome.device.resolved_path() {
//!     println!("attached at {path}");
//! }
//! ```

pub mod attach;
pub mod error;
pub mod executor;
pub mod initiator;
pub mod locate;
pub mod metrics;
pub mod multipath;
pub mod session;
pub mod types;
pub mod wait;

pub use attach::{AttachConfig, Attacher, LoginPolicy};
pub use error::{IscsiError, Result};
pub use executor::{CommandError, CommandExecutor, SystemExecutor};
pub use initiator::IdentityReader;
pub use types::{ChapCredentials, Connection, Device, Outcome, Portal};
pub use wait::{FsProbe, PathProbe, PathWaiter};
