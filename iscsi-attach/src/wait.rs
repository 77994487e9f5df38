//! Polling for device nodes created asynchronously by udev.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

/// Delay between existence checks.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Answers whether a filesystem path currently exists.
pub trait PathProbe {
    fn exists(&self, path: &str) -> bool;
}

impl<T: PathProbe + ?Sized> PathProbe for &T {
    fn exists(&self, path: &str) -> bool {
        (**self).exists(path)
    }
}

/// Checks the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl PathProbe for FsProbe {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// Blocking poll for a path with a fixed delay between attempts.
pub struct PathWaiter<P> {
    probe: P,
    delay: Duration,
}

impl<P: PathProbe> PathWaiter<P> {
    pub fn new(probe: P, delay: Duration) -> Self {
        Self { probe, delay }
    }

    /// Returns true as soon as `path` exists.
    ///
    /// `max_retries` is the number of checks; 0 still checks once and never
    /// sleeps. The delay only separates checks, so a miss on the final check
    /// returns immediately.
    pub fn wait_for(&self, path: &str, max_retries: u32) -> bool {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            if self.probe.exists(path) {
                debug!(path = %path, attempt, "Device path present");
                return true;
            }
            trace!(path = %path, attempt, attempts, "Device path not present yet");
            if attempt < attempts {
                thread::sleep(self.delay);
            }
        }
        debug!(path = %path, attempts, "Gave up waiting for device path");
        false
    }
}
