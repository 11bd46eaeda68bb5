// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Core of asymmetricfs, an asymmetric-encryption-aware filesystem.
//!
//! Files are presented as plaintext while mounted; on disk they exist only
//! as armored ciphertext encrypted to a set of public-key recipients via an
//! external tool (GnuPG by default). Writes accumulate in page-aligned,
//! optionally memory-locked buffers and are handed to the encryptor when the
//! last handle closes; reads decrypt on demand in read-write mode and are
//! denied in write-only mode.
//!
//! The [`vfs::AsymmetricFs`] object exposes a POSIX-shaped, path- and
//! handle-keyed operation set intended to sit behind a FUSE adapter.

pub mod config;
pub mod error;
pub mod page_buffer;
pub mod recipient;
pub mod subprocess;
pub mod vfs;

pub use config::{FsConfig, MemoryLock, MountMode};
pub use error::{FsError, FsResult};
pub use page_buffer::{PageAllocation, PageBuffer};
pub use recipient::Recipient;
pub use subprocess::Subprocess;
pub use vfs::{AsymmetricFs, DirEntry, EntryKind, HandleId};
