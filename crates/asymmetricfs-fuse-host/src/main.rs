// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! asymmetricfs mount binary.
//!
//! Parses the command line, validates recipients against the configured
//! encryption tool, hardens the process (core-dump suppression, optional
//! process-wide memory locking), and hands the filesystem to the FUSE
//! session.

mod adapter;

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::info;

use adapter::AsymmetricFuse;
use asymmetricfs_core::{AsymmetricFs, FsConfig, MemoryLock, MountMode, Recipient};

#[derive(Parser)]
#[command(name = "asymmetricfs", about = "An asymmetric encryption-aware filesystem")]
struct Args {
    /// Read-write mode: reads decrypt the backing store on demand.
    #[arg(long, conflicts_with = "wo")]
    rw: bool,

    /// Write-only mode: reads are denied once a file has been closed.
    #[arg(long)]
    wo: bool,

    /// Key to encrypt to. May be given multiple times.
    #[arg(short = 'r', long = "recipient", required = true, value_name = "KEY")]
    recipients: Vec<String>,

    /// Path to the GPG binary.
    #[arg(long, default_value = "gpg", value_name = "PATH")]
    gpg_binary: String,

    /// Memory locking policy for plaintext buffers.
    #[arg(long, default_value = "none", value_parser = parse_memory_lock)]
    memory_lock: MemoryLock,

    /// Leave core dumps enabled instead of disabling them at startup.
    #[arg(long)]
    enable_core_dumps: bool,

    /// Allow other users to access the filesystem.
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem.
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit.
    #[arg(long)]
    auto_unmount: bool,

    /// Backing directory holding the ciphertext.
    target: PathBuf,

    /// Mount point.
    mount_point: PathBuf,
}

fn parse_memory_lock(s: &str) -> Result<MemoryLock, String> {
    s.parse()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // A dying encryptor child must surface as EPIPE on the pipe write, not
    // kill the filesystem.
    // SAFETY: SIG_IGN carries no handler to race with.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("unable to ignore SIGPIPE")?;

    if !args.rw && !args.wo {
        bail!("--rw or --wo must be specified.");
    }
    let mode = if args.rw {
        MountMode::ReadWrite
    } else {
        MountMode::WriteOnly
    };

    // Plaintext lives in this process; keeping it out of core dumps is the
    // default.
    if !args.enable_core_dumps {
        // SAFETY: prctl with PR_SET_DUMPABLE has no memory-safety
        // preconditions.
        let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
        if ret == -1 {
            bail!(
                "Unable to disable core dumps.\n\
                 Run with --enable-core-dumps to continue without this measure."
            );
        }
    }

    if args.memory_lock == MemoryLock::All {
        mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
            .context("unable to lock process memory (--memory-lock all)")?;
    }

    let recipients = args
        .recipients
        .iter()
        .map(|recipient| {
            Recipient::validate(&args.gpg_binary, recipient)
                .map_err(|_| anyhow!("invalid recipient: {recipient}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let config = FsConfig {
        target: args.target.clone(),
        mode,
        recipients,
        gpg_path: args.gpg_binary.clone(),
        memory_lock: args.memory_lock,
    };

    let core = AsymmetricFs::new(config)
        .map_err(|err| anyhow!("target is invalid: {err}"))?;
    if !core.ready() {
        bail!("at least one recipient is required.");
    }

    let mut options = vec![
        fuser::MountOption::FSName("asymmetricfs".to_string()),
        fuser::MountOption::Subtype("asymmetricfs".to_string()),
    ];
    if args.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if args.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }
    if args.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }

    info!(
        target = %args.target.display(),
        mount_point = %args.mount_point.display(),
        mode = ?mode,
        memory_lock = %args.memory_lock,
        "mounting asymmetricfs"
    );

    fuser::mount2(AsymmetricFuse::new(core), &args.mount_point, &options)
        .context("FUSE session failed")?;

    info!("unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_are_mutually_exclusive() {
        let err = Args::try_parse_from([
            "asymmetricfs",
            "--rw",
            "--wo",
            "-r",
            "key",
            "/backing",
            "/mnt",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn recipients_are_required() {
        let err =
            Args::try_parse_from(["asymmetricfs", "--rw", "/backing", "/mnt"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn full_command_line_parses() {
        let args = Args::try_parse_from([
            "asymmetricfs",
            "--wo",
            "-r",
            "alpha",
            "--recipient",
            "beta",
            "--gpg-binary",
            "/usr/bin/gpg2",
            "--memory-lock",
            "buffers",
            "/backing",
            "/mnt",
        ])
        .unwrap();

        assert!(args.wo && !args.rw);
        assert_eq!(args.recipients, vec!["alpha", "beta"]);
        assert_eq!(args.gpg_binary, "/usr/bin/gpg2");
        assert_eq!(args.memory_lock, MemoryLock::Buffers);
        assert_eq!(args.target, PathBuf::from("/backing"));
        assert_eq!(args.mount_point, PathBuf::from("/mnt"));
    }
}
