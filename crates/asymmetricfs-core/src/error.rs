// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error types for the asymmetricfs core

use std::io;

use nix::errno::Errno;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file handle")]
    BadHandle,
    #[error("already exists")]
    AlreadyExists,
    #[error("busy")]
    Busy,
    #[error("out of memory")]
    OutOfMemory,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// The errno reported to the kernel protocol for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::NotPermitted => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::BadHandle => libc::EBADF,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::Busy => libc::EBUSY,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// An `EIO` carrying no further detail, for child-process failures.
    pub(crate) fn eio() -> FsError {
        FsError::Io(io::Error::from_raw_os_error(libc::EIO))
    }
}

impl From<Errno> for FsError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENOENT => FsError::NotFound,
            Errno::EACCES => FsError::AccessDenied,
            Errno::EPERM => FsError::NotPermitted,
            Errno::EINVAL => FsError::InvalidArgument,
            Errno::EBADF => FsError::BadHandle,
            Errno::EEXIST => FsError::AlreadyExists,
            Errno::EBUSY => FsError::Busy,
            Errno::ENOMEM => FsError::OutOfMemory,
            err => FsError::Io(err.into()),
        }
    }
}
