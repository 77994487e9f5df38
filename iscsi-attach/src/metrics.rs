//! Metrics for attach and locate operations.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding process installs a recorder.

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names
pub mod names {
    /// Counter: Total operations by type and status
    pub const OPERATIONS_TOTAL: &str = "iscsi_attach_operations_total";
    /// Histogram: Duration of operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "iscsi_attach_operation_duration_seconds";
    /// Counter: Login attempts that failed
    pub const LOGIN_FAILURES_TOTAL: &str = "iscsi_attach_login_failures_total";
}

/// Record an operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a failed login, labelled by whether CHAP was configured
pub fn record_login_failure(chap: bool) {
    let auth = if chap { "chap" } else { "none" };
    counter!(names::LOGIN_FAILURES_TOTAL, "auth" => auth).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        self.finish("success");
    }

    pub fn failure(self, status: &str) {
        self.finish(status);
    }

    fn finish(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, status, duration);
    }
}
