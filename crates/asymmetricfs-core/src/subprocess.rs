// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Child-process plumbing for the external encryption tool.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::select::{select, FdSet};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::warn;

/// A forked child with stdin/stdout wired either to caller-supplied
/// descriptors or to pipes owned by this instance.
///
/// The child sees exactly the descriptors 0, 1, and 2: pipes are created
/// close-on-exec and `dup2` clears the flag only on the duplicates installed
/// at the standard positions, so no other parent descriptor survives the
/// exec. Dropping a `Subprocess` waits for the child.
pub struct Subprocess {
    pid: Pid,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    status: Option<i32>,
}

impl Subprocess {
    /// Forks and execs `program` (resolved via `PATH`) with `argv`, whose
    /// first element is the child's `argv[0]`.
    ///
    /// For each of `stdin`/`stdout`, a supplied descriptor is wired directly
    /// to the child; `None` creates a pipe whose parent end is owned by the
    /// returned instance.
    pub fn spawn(
        stdin: Option<BorrowedFd<'_>>,
        stdout: Option<BorrowedFd<'_>>,
        program: &str,
        argv: &[String],
    ) -> io::Result<Self> {
        // Everything the child touches is prepared before the fork; only
        // async-signal-safe calls happen on the child side.
        let program_c = CString::new(program)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let argv_c = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        let stdin_pipe = match stdin {
            Some(_) => None,
            None => Some(unistd::pipe2(OFlag::O_CLOEXEC)?),
        };
        let stdout_pipe = match stdout {
            Some(_) => None,
            None => Some(unistd::pipe2(OFlag::O_CLOEXEC)?),
        };

        // SAFETY: the child branch calls only dup2/execvp/_exit.
        match unsafe { unistd::fork() }.map_err(io::Error::from)? {
            ForkResult::Parent { child } => Ok(Subprocess {
                pid: child,
                stdin: stdin_pipe.map(|(_, write_end)| write_end),
                stdout: stdout_pipe.map(|(read_end, _)| read_end),
                status: None,
            }),
            ForkResult::Child => {
                let wired = (|| -> nix::Result<()> {
                    let stdin_source = match (&stdin, &stdin_pipe) {
                        (Some(fd), _) => fd.as_raw_fd(),
                        (None, Some((read_end, _))) => read_end.as_raw_fd(),
                        (None, None) => unreachable!(),
                    };
                    if stdin_source != libc::STDIN_FILENO {
                        unistd::dup2(stdin_source, libc::STDIN_FILENO)?;
                    }

                    let stdout_target = match (&stdout, &stdout_pipe) {
                        (Some(fd), _) => fd.as_raw_fd(),
                        (None, Some((_, write_end))) => write_end.as_raw_fd(),
                        (None, None) => unreachable!(),
                    };
                    if stdout_target != libc::STDOUT_FILENO {
                        unistd::dup2(stdout_target, libc::STDOUT_FILENO)?;
                    }

                    unistd::execvp(&program_c, &argv_c)?;
                    Ok(())
                })();
                let _ = wired;
                // Exec failed; nothing sensible can be reported from here.
                unsafe { libc::_exit(127) }
            }
        }
    }

    /// Parent-side write end of the child's stdin, when owned.
    pub fn stdin(&self) -> Option<BorrowedFd<'_>> {
        self.stdin.as_ref().map(AsFd::as_fd)
    }

    /// Parent-side read end of the child's stdout, when owned.
    pub fn stdout(&self) -> Option<BorrowedFd<'_>> {
        self.stdout.as_ref().map(AsFd::as_fd)
    }

    /// Drives both pipe directions until the write side is fully consumed
    /// and either the read buffer is full or the child closes its stdout.
    ///
    /// Returns `(bytes_read, bytes_written)`. The owned stdin is closed as
    /// soon as the write side completes, so the child sees EOF. Supplying a
    /// non-empty `write_buf` while stdin is externally owned (or already
    /// closed) fails with `EINVAL`.
    pub fn communicate(
        &mut self,
        read_buf: &mut [u8],
        write_buf: &[u8],
    ) -> io::Result<(usize, usize)> {
        if !write_buf.is_empty() && self.stdin.is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut bytes_read = 0;
        let mut bytes_written = 0;

        loop {
            let want_write = bytes_written < write_buf.len() && self.stdin.is_some();
            let want_read = bytes_read < read_buf.len() && self.stdout.is_some();
            if !want_read && !want_write {
                break;
            }

            let (readable, writable) = {
                let mut read_fds = FdSet::new();
                let mut write_fds = FdSet::new();
                if want_read {
                    if let Some(fd) = self.stdout.as_ref() {
                        read_fds.insert(fd.as_fd());
                    }
                }
                if want_write {
                    if let Some(fd) = self.stdin.as_ref() {
                        write_fds.insert(fd.as_fd());
                    }
                }

                match select(None::<i32>, Some(&mut read_fds), Some(&mut write_fds), None, None) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err.into()),
                }

                (
                    self.stdout
                        .as_ref()
                        .is_some_and(|fd| read_fds.contains(fd.as_fd())),
                    self.stdin
                        .as_ref()
                        .is_some_and(|fd| write_fds.contains(fd.as_fd())),
                )
            };

            if want_write && writable {
                if let Some(fd) = self.stdin.as_ref() {
                    match unistd::write(fd.as_fd(), &write_buf[bytes_written..]) {
                        Ok(n) => {
                            bytes_written += n;
                            if bytes_written == write_buf.len() {
                                // Close so the child sees EOF.
                                self.stdin = None;
                            }
                        }
                        Err(Errno::EINTR) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }

            if want_read && readable {
                if let Some(fd) = self.stdout.as_ref() {
                    match unistd::read(fd.as_raw_fd(), &mut read_buf[bytes_read..]) {
                        Ok(0) => return Ok((bytes_read, bytes_written)),
                        Ok(n) => bytes_read += n,
                        Err(Errno::EINTR) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        Ok((bytes_read, bytes_written))
    }

    /// Waits for the child, closing any owned pipe ends first.
    ///
    /// Returns the exit status for a normal exit and `-1` for abnormal
    /// termination. Idempotent.
    pub fn wait(&mut self) -> i32 {
        if let Some(status) = self.status {
            return status;
        }

        self.stdin = None;
        self.stdout = None;

        let status = match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(_) => -1,
            Err(err) => {
                warn!(pid = %self.pid, "waitpid failed: {err}");
                -1
            }
        };
        self.status = Some(status);
        status
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        self.wait();
    }
}
