// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Validated encryption recipient handles.

use std::fmt;
use std::os::fd::BorrowedFd;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::subprocess::Subprocess;

/// An identifier the encryption tool accepts to designate a key.
///
/// A `Recipient` is only obtainable through [`Recipient::validate`], which
/// asks the tool whether its key ring knows the given string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient(String);

impl Recipient {
    /// Validates `recipient` against the key ring of the tool at `gpg_path`.
    ///
    /// The tool is invoked as `<tool> --list-keys <recipient>` with stdin and
    /// stdout redirected to the null device; exit 0 means valid.
    pub fn validate(gpg_path: &str, recipient: &str) -> FsResult<Self> {
        let stdin = open("/dev/null", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
        let stdout = open("/dev/null", OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;

        let mut child = Subprocess::spawn(
            // SAFETY: stdin/stdout stay open for the duration of the call.
            Some(unsafe { BorrowedFd::borrow_raw(stdin) }),
            Some(unsafe { BorrowedFd::borrow_raw(stdout) }),
            gpg_path,
            &[
                gpg_path.to_string(),
                "--list-keys".to_string(),
                recipient.to_string(),
            ],
        )?;

        let status = child.wait();
        if status == 0 {
            Ok(Recipient(recipient.to_string()))
        } else {
            debug!(recipient, status, "recipient rejected by {gpg_path}");
            Err(FsError::InvalidArgument)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `true` accepts anything, `false` rejects everything: enough to cover
    // both validation outcomes without a key ring.
    #[test]
    fn validation_follows_tool_exit_status() {
        let ok = Recipient::validate("true", "someone@example.com").unwrap();
        assert_eq!(ok.as_str(), "someone@example.com");
        assert_eq!(ok.to_string(), "someone@example.com");

        assert!(matches!(
            Recipient::validate("false", "someone@example.com"),
            Err(FsError::InvalidArgument)
        ));
    }
}
