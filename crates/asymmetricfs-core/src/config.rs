// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Configuration threaded through the filesystem constructor

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::recipient::Recipient;

/// Mount-time policy controlling whether decryption is permitted at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountMode {
    /// Reads decrypt the backing ciphertext on demand.
    ReadWrite,
    /// Reads are denied unless the handle created the file.
    WriteOnly,
}

/// Memory locking behavior for plaintext buffers.
///
/// `All` additionally implies a process-wide `mlockall` at startup, which is
/// the responsibility of the embedding program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryLock {
    All,
    Buffers,
    #[default]
    None,
}

impl FromStr for MemoryLock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(MemoryLock::All),
            "buffers" => Ok(MemoryLock::Buffers),
            "none" => Ok(MemoryLock::None),
            _ => Err(format!(
                "invalid memory-lock policy '{}'. Expected one of: all, buffers, none",
                s
            )),
        }
    }
}

impl fmt::Display for MemoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLock::All => f.write_str("all"),
            MemoryLock::Buffers => f.write_str("buffers"),
            MemoryLock::None => f.write_str("none"),
        }
    }
}

/// Filesystem configuration.
#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Backing directory holding the ciphertext.
    pub target: PathBuf,
    /// Read-write vs. write-only policy.
    pub mode: MountMode,
    /// Keys to encrypt to. At least one is required before mounting.
    pub recipients: Vec<Recipient>,
    /// Path to the external encryption tool, resolved via `PATH` when bare.
    pub gpg_path: String,
    /// Locking policy for plaintext pages.
    pub memory_lock: MemoryLock,
}

impl FsConfig {
    pub fn new(target: impl Into<PathBuf>, mode: MountMode) -> Self {
        FsConfig {
            target: target.into(),
            mode,
            recipients: Vec::new(),
            gpg_path: "gpg".to_string(),
            memory_lock: MemoryLock::None,
        }
    }
}
