//! External command execution.
//!
//! Every component in this crate talks to the host through a
//! [`CommandExecutor`]. The production implementation shells out with
//! `std::process::Command`; tests substitute a scripted fake.

use std::process::Command;

use thiserror::Error;
use tracing::debug;

/// open-iscsi administration tool
pub const ISCSIADM: &str = "iscsiadm";
/// SCSI device listing tool
pub const LSSCSI: &str = "lsscsi";
/// dm-multipath tool
pub const MULTIPATH: &str = "multipath";
/// Block device listing tool
pub const LSBLK: &str = "lsblk";
/// Used to read the initiator identity file
pub const CAT: &str = "cat";

/// Failure reported by an external command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {output}", status = exit_code_display(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        output: String,
    },
}

fn exit_code_display(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "signal".to_string(),
    }
}

impl CommandError {
    /// Build an unsuccessful-exit error.
    pub fn exit(program: impl Into<String>, code: Option<i32>, output: impl Into<String>) -> Self {
        CommandError::Exit {
            program: program.into(),
            code,
            output: output.into(),
        }
    }

    /// Combined output of the failed command, if it ran at all.
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Exit { output, .. } => Some(output),
        }
    }
}

/// Runs a named program with arguments.
///
/// On success returns the combined stdout and stderr text. An unsuccessful
/// exit status is an error carrying that same combined text.
pub trait CommandExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        (**self).run(program, args)
    }
}

/// Executes commands on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        debug!(program = %program, args = ?redacted_args(args), "Executing command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| CommandError::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            debug!(program = %program, status = ?output.status, output = %combined, "Command failed");
            return Err(CommandError::exit(program, output.status.code(), combined));
        }

        Ok(combined)
    }
}

/// Argument list safe for logs: values written to password settings are masked.
fn redacted_args(args: &[&str]) -> Vec<String> {
    let mut masked = Vec::with_capacity(args.len());
    let mut mask_next_value = false;
    for arg in args {
        if mask_next_value && arg.starts_with("--value=") {
            masked.push("--value=<redacted>".to_string());
        } else {
            masked.push(arg.to_string());
        }
        mask_next_value = arg.contains("password");
    }
    masked
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_executor_captures_output() {
        let out = SystemExecutor.run("sh", &["-c", "echo out; echo err 1>&2"]).unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[test]
    fn test_system_executor_reports_exit_status() {
        let err = SystemExecutor
            .run("sh", &["-c", "echo boom; exit 3"])
            .unwrap_err();
        match &err {
            CommandError::Exit { code, output, .. } => {
                assert_eq!(*code, Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn test_redacted_args_masks_password_value() {
        let args = [
            "-m",
            "node",
            "--op=update",
            "--name",
            "node.session.auth.password",
            "--value=hunter2",
        ];
        let masked = redacted_args(&args);
        assert_eq!(masked[5], "--value=<redacted>");

        let args = ["--name", "node.session.auth.username", "--value=admin"];
        assert_eq!(redacted_args(&args)[2], "--value=admin");
    }

    #[test]
    fn test_system_executor_missing_program() {
        let err = SystemExecutor
            .run("definitely-not-a-real-program-xyz", &[])
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert!(err.output().is_none());
    }
}
