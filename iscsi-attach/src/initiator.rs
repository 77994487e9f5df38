//! Local initiator identity.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error};

use crate::error::{IscsiError, Result};
use crate::executor::{CAT, CommandExecutor};

/// open-iscsi initiator identity file
pub const DEFAULT_INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

static INITIATOR_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*InitiatorName=(.*)$").expect("Invalid regex pattern")
});

/// Extract every `InitiatorName=` value, in file order.
pub fn parse_initiator_names(content: &str) -> Vec<String> {
    INITIATOR_NAME
        .captures_iter(content)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Reads the initiator names configured on this host.
pub struct IdentityReader<E> {
    executor: E,
    path: PathBuf,
}

impl<E: CommandExecutor> IdentityReader<E> {
    pub fn new(executor: E) -> Self {
        Self::with_path(executor, DEFAULT_INITIATOR_NAME_FILE)
    }

    pub fn with_path(executor: E, path: impl AsRef<Path>) -> Self {
        Self {
            executor,
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initiator IQNs from the identity file. Duplicates are kept.
    pub fn initiator_names(&self) -> Result<Vec<String>> {
        let path = self.path.to_string_lossy();
        let content = self.executor.run(CAT, &[&*path]).map_err(|e| {
            error!(path = %path, error = %e, "Unable to read initiator names");
            IscsiError::IdentityUnavailable(e)
        })?;

        let names = parse_initiator_names(&content);
        debug!(path = %path, names = ?names, "Read initiator names");
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandError;
    use crate::executor::fake::ScriptedExecutor;

    const FIXTURE: &str = "\
## DO NOT EDIT OR REMOVE THIS FILE!
## If you remove this file, the iSCSI daemon will not start.
InitiatorName=iqn.1993-08.org.debian:01:abc123
#InitiatorName=iqn.commented.out
InitiatorName=iqn.2005-03.org.open-iscsi:second
  InitiatorName=iqn.1993-08.org.debian:01:abc123
";

    #[test]
    fn test_parse_preserves_order_and_duplicates() {
        assert_eq!(
            parse_initiator_names(FIXTURE),
            vec![
                "iqn.1993-08.org.debian:01:abc123",
                "iqn.2005-03.org.open-iscsi:second",
                "iqn.1993-08.org.debian:01:abc123",
            ]
        );
    }

    #[test]
    fn test_parse_no_match_is_empty() {
        assert!(parse_initiator_names("").is_empty());
        assert!(parse_initiator_names("## nothing here\nInitiatorAlias=foo\n").is_empty());
    }

    #[test]
    fn test_parse_crlf() {
        assert_eq!(
            parse_initiator_names("InitiatorName=iqn.test:crlf\r\n"),
            vec!["iqn.test:crlf"]
        );
    }

    #[test]
    fn test_reader_reads_configured_file() {
        let exec = ScriptedExecutor::new(|_, _| Ok(FIXTURE.to_string()));
        let reader = IdentityReader::with_path(&exec, "/tmp/initiatorname.iscsi");
        let names = reader.initiator_names().unwrap();

        assert_eq!(names.len(), 3);
        assert_eq!(exec.calls(), vec!["cat /tmp/initiatorname.iscsi"]);
    }

    #[test]
    fn test_reader_default_path() {
        let exec = ScriptedExecutor::ok();
        let reader = IdentityReader::new(&exec);
        assert_eq!(reader.path(), Path::new(DEFAULT_INITIATOR_NAME_FILE));
        assert!(reader.initiator_names().unwrap().is_empty());
        assert_eq!(exec.calls(), vec!["cat /etc/iscsi/initiatorname.iscsi"]);
    }

    #[test]
    fn test_reader_propagates_read_failure() {
        let exec = ScriptedExecutor::new(|program, _| {
            Err(CommandError::exit(
                program,
                Some(1),
                "cat: /etc/iscsi/initiatorname.iscsi: No such file or directory",
            ))
        });
        let err = IdentityReader::new(&exec).initiator_names().unwrap_err();

        match err {
            IscsiError::IdentityUnavailable(source) => {
                assert!(source.output().unwrap().contains("No such file"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
