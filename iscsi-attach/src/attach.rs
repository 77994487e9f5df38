//! The attach workflow.
//!
//! `Attacher::attach` is idempotent: if the expected by-path node already
//! exists nothing is logged in. Otherwise it logs in and polls for the node.
//! Only an unusable interface fails the call; whether the device showed up
//! is reported through the returned device's path.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::error::{IscsiError, Result};
use crate::executor::{CommandExecutor, ISCSIADM};
use crate::locate;
use crate::metrics::{self, OperationTimer};
use crate::multipath;
use crate::session;
use crate::types::{Device, Outcome};
use crate::wait::{DEFAULT_RETRY_DELAY, PathProbe, PathWaiter};

/// Path checks after login before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

// ============================================================================
// LoginPolicy
// ============================================================================

/// What `attach` does when the login step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginPolicy {
    /// Record the failure as a warning and keep polling for the device
    #[default]
    BestEffort,
    /// Return the login error immediately
    Strict,
}

impl Display for LoginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginPolicy::BestEffort => write!(f, "best-effort"),
            LoginPolicy::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for LoginPolicy {
    type Err = LoginPolicyParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best-effort" | "besteffort" | "" => Ok(LoginPolicy::BestEffort),
            "strict" => Ok(LoginPolicy::Strict),
            _ => Err(LoginPolicyParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid login policy.
#[derive(Debug, Clone)]
pub struct LoginPolicyParseError(String);

impl Display for LoginPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown login policy '{}': expected 'best-effort' or 'strict'",
            self.0
        )
    }
}

impl std::error::Error for LoginPolicyParseError {}

// ============================================================================
// AttachConfig
// ============================================================================

#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Delay between path checks
    pub retry_delay: Duration,
    /// Path checks after login
    pub max_retries: u32,
    pub login_policy: LoginPolicy,
    /// Resolve the mapper device once the raw path is present
    pub resolve_multipath: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            login_policy: LoginPolicy::default(),
            resolve_multipath: false,
        }
    }
}

// ============================================================================
// Attacher
// ============================================================================

/// Attaches, locates and detaches iSCSI devices on this host.
pub struct Attacher<E, P> {
    executor: E,
    waiter: PathWaiter<P>,
    config: AttachConfig,
}

impl<E: CommandExecutor, P: PathProbe> Attacher<E, P> {
    pub fn new(executor: E, probe: P, config: AttachConfig) -> Self {
        let waiter = PathWaiter::new(probe, config.retry_delay);
        Self {
            executor,
            waiter,
            config,
        }
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Make sure `device` is attached and report where its node is.
    #[instrument(skip(self, device), fields(target_iqn = %device.target_iqn, portal = %device.portal, lun = device.lun))]
    pub fn attach(&self, mut device: Device) -> Result<Outcome> {
        let timer = OperationTimer::new("attach");

        if let Err(e) = self.check_iface(&device.iface) {
            timer.failure("interface_unavailable");
            return Err(e);
        }

        let path = device.expected_path();
        if self.waiter.wait_for(&path, 0) {
            info!(path = %path, "Device already attached");
            device.set_path(path);
            let outcome = self.finish(device, Vec::new());
            timer.success();
            return Ok(outcome);
        }
        device.clear_paths();

        let mut warnings = Vec::new();
        if let Err(e) = self.login(&device) {
            metrics::record_login_failure(device.use_chap());
            match self.config.login_policy {
                LoginPolicy::Strict => {
                    error!(error = %e, "Login failed, aborting attach");
                    timer.failure("login_failed");
                    return Err(e);
                }
                LoginPolicy::BestEffort => {
                    warn!(error = %e, "Login failed, still waiting for device");
                    warnings.push(e);
                }
            }
        }

        if self.waiter.wait_for(&path, self.config.max_retries) {
            info!(path = %path, "Device attached");
            device.set_path(path);
            timer.success();
        } else {
            warn!(
                path = %path,
                retries = self.config.max_retries,
                "Device path did not appear"
            );
            timer.failure("not_attached");
        }

        Ok(self.finish(device, warnings))
    }

    /// See [`locate::locate`].
    pub fn locate(&self, target_iqn: &str) -> Result<Outcome> {
        locate::locate(&self.executor, target_iqn)
    }

    /// Log out of the device's target. Not being logged in is success.
    pub fn detach(&self, device: &Device) -> Result<()> {
        session::logout(&self.executor, &device.target_iqn, &device.portal)
    }

    fn check_iface(&self, iface: &str) -> Result<()> {
        self.executor
            .run(ISCSIADM, &["-m", "iface", "-I", iface, "-o", "show"])
            .map_err(|e| {
                error!(iface = %iface, error = %e, "iscsi unable to read from interface");
                IscsiError::InterfaceUnavailable {
                    iface: iface.to_string(),
                    source: e,
                }
            })?;
        Ok(())
    }

    fn login(&self, device: &Device) -> Result<()> {
        match &device.chap {
            Some(chap) => session::login_with_chap(
                &self.executor,
                &device.target_iqn,
                &device.portal,
                &chap.username,
                &chap.password,
                &device.iface,
            ),
            None => session::login(
                &self.executor,
                &device.target_iqn,
                &device.portal,
                &device.iface,
            ),
        }
    }

    fn finish(&self, mut device: Device, mut warnings: Vec<IscsiError>) -> Outcome {
        if self.config.resolve_multipath
            && let Some(warning) = multipath::apply(&self.executor, &mut device)
        {
            warnings.push(warning);
        }
        Outcome { device, warnings }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::executor::fake::ScriptedExecutor;
    use crate::executor::{CommandError, LSBLK, MULTIPATH};
    use crate::types::ChapCredentials;

    const EXPECTED: &str = "/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-iqn.test:1lun-0";

    /// Fixed set of existing paths; counts every check.
    struct FakeFs {
        present: RefCell<Vec<String>>,
        checks: Cell<u32>,
    }

    impl FakeFs {
        fn empty() -> Self {
            Self {
                present: RefCell::new(Vec::new()),
                checks: Cell::new(0),
            }
        }

        fn with(path: &str) -> Self {
            let fs = Self::empty();
            fs.present.borrow_mut().push(path.to_string());
            fs
        }
    }

    impl PathProbe for FakeFs {
        fn exists(&self, path: &str) -> bool {
            self.checks.set(self.checks.get() + 1);
            self.present.borrow().iter().any(|p| p == path)
        }
    }

    fn config() -> AttachConfig {
        AttachConfig {
            retry_delay: Duration::ZERO,
            max_retries: 3,
            ..Default::default()
        }
    }

    fn device() -> Device {
        Device::new("iqn.test:1", "10.0.0.1:3260", 0)
    }

    fn failing_login() -> ScriptedExecutor {
        ScriptedExecutor::new(|program, args| {
            if args.contains(&"--login") {
                Err(CommandError::exit(program, Some(24), "iscsiadm: Login failed"))
            } else {
                Ok(String::new())
            }
        })
    }

    #[test]
    fn test_default_config() {
        let cfg = AttachConfig::default();
        assert_eq!(cfg.retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.max_retries, 10);
        assert_eq!(cfg.login_policy, LoginPolicy::BestEffort);
        assert!(!cfg.resolve_multipath);
    }

    #[test]
    fn test_login_policy_from_str() {
        assert_eq!("strict".parse::<LoginPolicy>().unwrap(), LoginPolicy::Strict);
        assert_eq!("STRICT".parse::<LoginPolicy>().unwrap(), LoginPolicy::Strict);
        assert_eq!(
            "best-effort".parse::<LoginPolicy>().unwrap(),
            LoginPolicy::BestEffort
        );
        assert_eq!("".parse::<LoginPolicy>().unwrap(), LoginPolicy::BestEffort);
        assert!("lenient".parse::<LoginPolicy>().is_err());
        assert_eq!(LoginPolicy::Strict.to_string(), "strict");
    }

    #[test]
    fn test_already_attached_skips_login() {
        let exec = failing_login();
        let fs = FakeFs::with(EXPECTED);
        let attacher = Attacher::new(&exec, &fs, config());

        let outcome = attacher.attach(device()).unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.device.path(), Some(EXPECTED));
        assert_eq!(fs.checks.get(), 1);
        assert_eq!(
            exec.calls(),
            vec!["iscsiadm -m iface -I default -o show"]
        );
    }

    #[test]
    fn test_attach_is_idempotent() {
        let exec = failing_login();
        let fs = FakeFs::with(EXPECTED);
        let attacher = Attacher::new(&exec, &fs, config());

        let first = attacher.attach(device()).unwrap();
        let second = attacher.attach(first.device.clone()).unwrap();
        assert_eq!(first.device, second.device);
        assert_eq!(exec.calls_matching("--login"), 0);
    }

    #[test]
    fn test_reattach_after_node_vanished_clears_stale_paths() {
        let exec = ScriptedExecutor::new(|program, _| match program {
            MULTIPATH => Ok(format!("{} is a valid multipath device path", EXPECTED)),
            LSBLK => Ok("sdb\nmpatha\n".to_string()),
            _ => Ok(String::new()),
        });
        let fs = FakeFs::with(EXPECTED);
        let cfg = AttachConfig {
            resolve_multipath: true,
            ..config()
        };
        let attacher = Attacher::new(&exec, &fs, cfg);

        let first = attacher.attach(device()).unwrap();
        assert_eq!(first.device.path(), Some(EXPECTED));
        assert!(first.device.multipath_device().is_some());

        fs.present.borrow_mut().clear();
        let second = attacher.attach(first.device).unwrap();
        assert_eq!(exec.calls_matching("--login"), 1);
        assert!(second.device.path().is_none());
        assert!(second.device.multipath_device().is_none());
        assert!(second.device.resolved_path().is_none());
    }

    #[test]
    fn test_interface_unavailable() {
        let exec = ScriptedExecutor::new(|program, args| {
            if args.contains(&"iface") {
                Err(CommandError::exit(
                    program,
                    Some(21),
                    "iscsiadm: Could not read iface bogus (6)",
                ))
            } else {
                Ok(String::new())
            }
        });
        let fs = FakeFs::with(EXPECTED);
        let attacher = Attacher::new(&exec, &fs, config());

        let err = attacher.attach(device().with_iface("bogus")).unwrap_err();
        match &err {
            IscsiError::InterfaceUnavailable { iface, .. } => assert_eq!(iface, "bogus"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs.checks.get(), 0);
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn test_login_failure_is_a_warning() {
        let exec = failing_login();
        let fs = FakeFs::empty();
        let attacher = Attacher::new(&exec, &fs, config());

        let outcome = attacher.attach(device()).unwrap();
        assert!(outcome.device.path().is_none());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(matches!(outcome.warnings[0], IscsiError::LoginFailed { .. }));
        // one idempotency check plus max_retries polls
        assert_eq!(fs.checks.get(), 4);
    }

    #[test]
    fn test_strict_login_aborts() {
        let exec = failing_login();
        let fs = FakeFs::empty();
        let cfg = AttachConfig {
            login_policy: LoginPolicy::Strict,
            ..config()
        };
        let attacher = Attacher::new(&exec, &fs, cfg);

        let err = attacher.attach(device()).unwrap_err();
        assert!(matches!(err, IscsiError::LoginFailed { .. }));
        assert_eq!(fs.checks.get(), 1);
    }

    #[test]
    fn test_chap_attach_uses_chap_login() {
        let exec = ScriptedExecutor::ok();
        let fs = FakeFs::empty();
        let attacher = Attacher::new(&exec, &fs, config());

        let dev = device()
            .with_iface("iface0")
            .with_chap(ChapCredentials::new("user", "secret"));
        let outcome = attacher.attach(dev).unwrap();

        assert!(outcome.is_clean());
        assert!(outcome.device.path().is_none());
        assert_eq!(exec.calls_matching("--op new"), 1);
        assert_eq!(exec.calls_matching("--interface iface0"), 1);
        assert_eq!(exec.calls_matching("node.session.auth."), 3);
        assert_eq!(exec.calls_matching("--login"), 1);
    }

    #[test]
    fn test_chap_failure_recorded() {
        let exec = ScriptedExecutor::new(|program, args| {
            if args.contains(&"--op") {
                Err(CommandError::exit(program, Some(6), "iscsiadm: Could not create new record"))
            } else {
                Ok(String::new())
            }
        });
        let fs = FakeFs::empty();
        let attacher = Attacher::new(&exec, &fs, config());

        let dev = device().with_chap(ChapCredentials::new("user", "secret"));
        let outcome = attacher.attach(dev).unwrap();
        assert!(matches!(outcome.warnings[0], IscsiError::NodeCreateFailed { .. }));
        assert_eq!(exec.calls_matching("--login"), 0);
    }

    #[test]
    fn test_resolve_multipath_after_attach() {
        let exec = ScriptedExecutor::new(|program, _| match program {
            MULTIPATH => Ok(format!("{} is a valid multipath device path", EXPECTED)),
            LSBLK => Ok("sdb\nmpatha\n".to_string()),
            _ => Ok(String::new()),
        });
        let fs = FakeFs::with(EXPECTED);
        let cfg = AttachConfig {
            resolve_multipath: true,
            ..config()
        };
        let attacher = Attacher::new(&exec, &fs, cfg);

        let outcome = attacher.attach(device()).unwrap();
        assert_eq!(outcome.device.path(), Some(EXPECTED));
        assert_eq!(outcome.device.multipath_device(), Some("/dev/mapper/mpatha"));
    }

    #[test]
    fn test_detach_logs_out() {
        let exec = ScriptedExecutor::ok();
        let attacher = Attacher::new(&exec, FakeFs::empty(), config());
        attacher.detach(&device()).unwrap();
        assert_eq!(
            exec.calls(),
            vec!["iscsiadm -m node -T iqn.test:1 -p 10.0.0.1:3260 --logout"]
        );
    }
}
