// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Filesystem-object tests driven by a stand-in encryption tool.
//!
//! The stand-in copies stdin to stdout, so these tests cover the path/handle
//! tables, the open/close state machine, and the per-operation policy without
//! needing a key ring. Real-gpg coverage lives in `gpg_roundtrip.rs`.

use std::fs;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::AccessFlags;
use tempfile::TempDir;

use asymmetricfs_core::{
    AsymmetricFs, EntryKind, FsConfig, FsError, MemoryLock, MountMode, Recipient,
};
use asymmetricfs_test_utils::{failing_tool, identity_tool};

struct Fixture {
    backing: TempDir,
    _tool_dir: TempDir,
    fs: AsymmetricFs,
}

fn fixture_with_tool(mode: MountMode, tool: fn(&std::path::Path) -> std::io::Result<std::path::PathBuf>) -> Fixture {
    let backing = TempDir::new().unwrap();
    let tool_dir = TempDir::new().unwrap();
    let tool = tool(tool_dir.path()).unwrap();

    let config = FsConfig {
        target: backing.path().to_path_buf(),
        mode,
        recipients: vec![Recipient::validate("true", "test@example.com").unwrap()],
        gpg_path: tool.to_str().unwrap().to_string(),
        memory_lock: MemoryLock::None,
    };

    let fs = AsymmetricFs::new(config).unwrap();
    assert!(fs.ready());
    Fixture {
        backing,
        _tool_dir: tool_dir,
        fs,
    }
}

fn fixture(mode: MountMode) -> Fixture {
    fixture_with_tool(mode, identity_tool)
}

fn read_all(fs: &AsymmetricFs, handle: asymmetricfs_core::HandleId) -> Vec<u8> {
    let mut buf = vec![0u8; 1 << 16];
    let n = fs.read(handle, 0, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn round_trip() {
    let f = fixture(MountMode::ReadWrite);

    let handle = f
        .fs
        .create("/test", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    assert_eq!(f.fs.write(handle, 0, b"abcdefg").unwrap(), 7);

    // The contents are visible before the handle closes.
    assert_eq!(read_all(&f.fs, handle), b"abcdefg");
    f.fs.release(handle).unwrap();

    // And again through a fresh read-only handle.
    let handle = f.fs.open("/test", OFlag::O_RDONLY).unwrap();
    assert_eq!(read_all(&f.fs, handle), b"abcdefg");
    f.fs.release(handle).unwrap();
}

#[test]
fn append() {
    let f = fixture(MountMode::ReadWrite);

    let handle = f
        .fs
        .create("/test", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();
    f.fs.release(handle).unwrap();

    let handle = f
        .fs
        .open("/test", OFlag::O_APPEND | OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"hijklmn").unwrap();
    f.fs.release(handle).unwrap();

    let handle = f.fs.open("/test", OFlag::O_RDONLY).unwrap();
    assert_eq!(read_all(&f.fs, handle), b"abcdefghijklmn");
    f.fs.release(handle).unwrap();
}

#[test]
fn partial_truncate_on_open_handle() {
    let f = fixture(MountMode::ReadWrite);

    let handle = f
        .fs
        .create("/t", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();
    f.fs.ftruncate(handle, 3).unwrap();

    let st = f.fs.fgetattr(handle).unwrap();
    assert_eq!(st.st_size, 3);
    f.fs.release(handle).unwrap();

    let handle = f.fs.open("/t", OFlag::O_RDONLY).unwrap();
    assert_eq!(read_all(&f.fs, handle), b"abc");
    f.fs.release(handle).unwrap();
}

#[test]
fn write_only_mode_denies_reads_of_closed_files() {
    let f = fixture(MountMode::WriteOnly);

    let handle = f
        .fs
        .create("/a", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"x").unwrap();
    f.fs.release(handle).unwrap();

    let handle = f.fs.open("/a", OFlag::O_RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(
        f.fs.read(handle, 0, &mut buf),
        Err(FsError::AccessDenied)
    ));
    f.fs.release(handle).unwrap();
}

#[test]
fn write_only_mode_reads_back_freshly_created_files() {
    let f = fixture(MountMode::WriteOnly);

    let handle = f
        .fs
        .create("/fresh", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"visible").unwrap();

    // This handle created the file, so its plaintext is still in memory.
    assert_eq!(read_all(&f.fs, handle), b"visible");
    f.fs.release(handle).unwrap();
}

#[test]
fn rename_while_open() {
    let f = fixture(MountMode::ReadWrite);

    let handle = f
        .fs
        .create("/foo", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();

    f.fs.rename("/foo", "/bar").unwrap();

    assert!(matches!(f.fs.getattr("/foo"), Err(FsError::NotFound)));

    let st = f.fs.getattr("/bar").unwrap();
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFREG);
    assert_eq!(st.st_size, 7);

    let st = f.fs.fgetattr(handle).unwrap();
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFREG);
    assert_eq!(st.st_size, 7);

    f.fs.release(handle).unwrap();

    // The backing entry moved with it.
    assert!(f.backing.path().join("bar").exists());
    assert!(!f.backing.path().join("foo").exists());
}

#[test]
fn rename_back_restores_both_views() {
    let f = fixture(MountMode::ReadWrite);

    let handle = f
        .fs
        .create("/a", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.rename("/a", "/b").unwrap();
    f.fs.rename("/b", "/a").unwrap();

    assert!(f.fs.getattr("/a").is_ok());
    assert!(matches!(f.fs.getattr("/b"), Err(FsError::NotFound)));
    f.fs.release(handle).unwrap();
    assert!(f.backing.path().join("a").exists());
}

#[test]
fn second_open_shares_the_state() {
    let f = fixture(MountMode::ReadWrite);

    let first = f
        .fs
        .create("/shared", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.write(first, 0, b"abcdefg").unwrap();

    let second = f.fs.open("/shared", OFlag::O_RDONLY).unwrap();
    assert_eq!(first, second);
    assert_eq!(read_all(&f.fs, second), b"abcdefg");

    f.fs.release(first).unwrap();
    // Still open through the second reference.
    assert_eq!(f.fs.fgetattr(second).unwrap().st_size, 7);
    f.fs.release(second).unwrap();

    assert!(matches!(
        f.fs.fgetattr(second),
        Err(FsError::BadHandle)
    ));
}

#[test]
fn readdir_lists_dot_entries_and_new_files() {
    let f = fixture(MountMode::WriteOnly);

    let dir = f.fs.opendir("/").unwrap();

    let names: Vec<String> = f
        .fs
        .readdir(dir)
        .unwrap()
        .iter()
        .map(|e| e.name.to_string_lossy().to_string())
        .collect();
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));
    assert_eq!(names.len(), 2);

    let handle = f
        .fs
        .create("/foo", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.release(handle).unwrap();

    let entries = f.fs.readdir(dir).unwrap();
    assert_eq!(entries.len(), 3);
    let foo = entries
        .iter()
        .find(|e| e.name == "foo")
        .expect("foo is listed");
    assert_eq!(foo.kind, EntryKind::File);

    f.fs.releasedir(dir).unwrap();
    assert!(matches!(f.fs.readdir(dir), Err(FsError::BadHandle)));
}

#[test]
fn readdir_reports_symlinks_and_directories() {
    let f = fixture(MountMode::ReadWrite);

    f.fs.mkdir("/sub", Mode::from_bits_truncate(0o755)).unwrap();
    f.fs.symlink("sub", "/link").unwrap();

    let dir = f.fs.opendir("/").unwrap();
    let entries = f.fs.readdir(dir).unwrap();
    f.fs.releasedir(dir).unwrap();

    let kind_of = |name: &str| {
        entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.kind)
            .unwrap_or_else(|| panic!("{name} not listed"))
    };
    assert_eq!(kind_of("sub"), EntryKind::Directory);
    assert_eq!(kind_of("link"), EntryKind::Symlink);

    assert_eq!(f.fs.readlink("/link").unwrap(), "sub");
}

#[test]
fn chmod_is_visible_through_getattr() {
    let f = fixture(MountMode::ReadWrite);

    let handle = f
        .fs
        .create("/test", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.release(handle).unwrap();

    assert_eq!(f.fs.getattr("/test").unwrap().st_mode & 0o7777, 0o600);
    f.fs.chmod("/test", Mode::from_bits_truncate(0o400)).unwrap();
    assert_eq!(f.fs.getattr("/test").unwrap().st_mode & 0o7777, 0o400);
}

#[test]
fn write_only_getattr_masks_read_bits() {
    let f = fixture(MountMode::WriteOnly);

    let handle = f
        .fs
        .create("/m", Mode::from_bits_truncate(0o644), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"secret").unwrap();
    f.fs.release(handle).unwrap();

    let st = f.fs.getattr("/m").unwrap();
    assert_eq!(
        st.st_mode & (libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH),
        0
    );

    // Directories keep their read bits; they only reveal names.
    let st = f.fs.getattr("/").unwrap();
    assert_ne!(st.st_mode & libc::S_IRUSR, 0);
}

#[test]
fn chown_to_root_is_refused() {
    let f = fixture(MountMode::ReadWrite);
    let handle = f
        .fs
        .create("/o", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.release(handle).unwrap();

    assert!(matches!(
        f.fs.chown("/o", Some(nix::unistd::Uid::from_raw(0)), None),
        Err(FsError::NotPermitted)
    ));
    assert!(matches!(
        f.fs.chown("/o", None, Some(nix::unistd::Gid::from_raw(0))),
        Err(FsError::NotPermitted)
    ));
}

#[test]
fn link_is_always_refused() {
    let f = fixture(MountMode::ReadWrite);
    assert!(matches!(
        f.fs.link("/a", "/b"),
        Err(FsError::NotPermitted)
    ));
}

#[test]
fn truncate_unopened_to_zero_is_idempotent() {
    let f = fixture(MountMode::WriteOnly);

    let handle = f
        .fs
        .create("/t", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();
    f.fs.release(handle).unwrap();
    assert!(fs::metadata(f.backing.path().join("t")).unwrap().len() > 0);

    f.fs.truncate("/t", 0).unwrap();
    assert_eq!(fs::metadata(f.backing.path().join("t")).unwrap().len(), 0);

    f.fs.truncate("/t", 0).unwrap();
    assert_eq!(fs::metadata(f.backing.path().join("t")).unwrap().len(), 0);
}

#[test]
fn nonzero_truncate_is_refused_in_write_only_mode() {
    let f = fixture(MountMode::WriteOnly);

    let handle = f
        .fs
        .create("/t", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();
    assert!(matches!(
        f.fs.ftruncate(handle, 3),
        Err(FsError::AccessDenied)
    ));
    f.fs.release(handle).unwrap();

    assert!(matches!(
        f.fs.truncate("/t", 3),
        Err(FsError::AccessDenied)
    ));
}

#[test]
fn truncate_missing_file_reports_not_found() {
    let f = fixture(MountMode::ReadWrite);
    assert!(matches!(
        f.fs.truncate("/missing", 0),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        f.fs.truncate("/missing", -1),
        Err(FsError::InvalidArgument)
    ));
}

#[test]
fn zero_byte_writes_leave_no_trace() {
    let f = fixture(MountMode::WriteOnly);

    let handle = f
        .fs
        .create("/z", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    assert_eq!(f.fs.write(handle, 0, &[]).unwrap(), 0);
    assert_eq!(f.fs.fgetattr(handle).unwrap().st_size, 0);
    f.fs.release(handle).unwrap();

    // Nothing was dirty, so no encryptor ran and the file stayed empty.
    assert_eq!(fs::metadata(f.backing.path().join("z")).unwrap().len(), 0);
}

#[test]
fn unknown_handles_are_rejected() {
    let f = fixture(MountMode::ReadWrite);
    let bogus = asymmetricfs_core::HandleId(9999);

    let mut buf = [0u8; 8];
    assert!(matches!(
        f.fs.read(bogus, 0, &mut buf),
        Err(FsError::BadHandle)
    ));
    assert!(matches!(
        f.fs.write(bogus, 0, b"x"),
        Err(FsError::BadHandle)
    ));
    assert!(matches!(f.fs.fgetattr(bogus), Err(FsError::BadHandle)));
    assert!(matches!(
        f.fs.ftruncate(bogus, 0),
        Err(FsError::BadHandle)
    ));
    assert!(matches!(f.fs.flush(bogus), Err(FsError::BadHandle)));
    assert!(matches!(
        f.fs.fsync(bogus, false),
        Err(FsError::BadHandle)
    ));
    // An unknown release is ignored, as the kernel protocol expects.
    assert!(f.fs.release(bogus).is_ok());
}

#[test]
fn negative_offsets_are_rejected() {
    let f = fixture(MountMode::ReadWrite);
    let handle = f
        .fs
        .create("/n", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        f.fs.read(handle, -1, &mut buf),
        Err(FsError::InvalidArgument)
    ));
    assert!(matches!(
        f.fs.write(handle, -1, b"x"),
        Err(FsError::InvalidArgument)
    ));
    assert!(matches!(
        f.fs.ftruncate(handle, -1),
        Err(FsError::InvalidArgument)
    ));
    f.fs.release(handle).unwrap();
}

#[test]
fn failed_encryptor_surfaces_on_release() {
    // The tool exits without reading its stdin, so the splice must see
    // EPIPE rather than a fatal SIGPIPE.
    // SAFETY: SIG_IGN carries no handler to race with.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let f = fixture_with_tool(MountMode::WriteOnly, failing_tool);

    let handle = f
        .fs
        .create("/doomed", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"payload").unwrap();

    match f.fs.release(handle) {
        Err(FsError::Io(err)) => assert_eq!(err.raw_os_error(), Some(libc::EIO)),
        other => panic!("expected EIO from release, got {other:?}"),
    }

    // The state is destroyed regardless of the failure.
    assert!(matches!(f.fs.fgetattr(handle), Err(FsError::BadHandle)));
}

#[test]
fn failed_decryptor_leaves_the_load_retryable() {
    let f = fixture_with_tool(MountMode::ReadWrite, failing_tool);

    // Plant ciphertext behind the filesystem's back.
    fs::write(f.backing.path().join("cipher"), b"opaque bytes").unwrap();

    let handle = f.fs.open("/cipher", OFlag::O_RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(
        f.fs.read(handle, 0, &mut buf),
        Err(FsError::Io(_))
    ));
    // The buffer stayed unpopulated, so the read fails the same way again
    // instead of serving an empty file.
    assert!(matches!(
        f.fs.read(handle, 0, &mut buf),
        Err(FsError::Io(_))
    ));
    f.fs.release(handle).unwrap();
}

#[test]
fn recipients_cannot_change_under_open_handles() {
    let f = fixture(MountMode::WriteOnly);

    let replacement = vec![Recipient::validate("true", "other@example.com").unwrap()];
    let handle = f
        .fs
        .create("/r", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    assert!(matches!(
        f.fs.set_recipients(replacement.clone()),
        Err(FsError::Busy)
    ));

    f.fs.release(handle).unwrap();
    f.fs.set_recipients(replacement).unwrap();
    assert!(f.fs.ready());
}

#[test]
fn write_only_access_policy() {
    let f = fixture(MountMode::WriteOnly);

    // Closed file: no read access.
    let handle = f
        .fs
        .create("/w", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.release(handle).unwrap();
    assert!(matches!(
        f.fs.access("/w", AccessFlags::R_OK),
        Err(FsError::AccessDenied)
    ));
    // Write access still passes through to the backing store.
    f.fs.access("/w", AccessFlags::W_OK).unwrap();

    // Open, just-created file: readable.
    let handle = f
        .fs
        .create("/open", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.access("/open", AccessFlags::R_OK).unwrap();
    f.fs.release(handle).unwrap();

    // Append handles are never readable.
    let handle = f
        .fs
        .open("/w", OFlag::O_APPEND | OFlag::O_WRONLY)
        .unwrap();
    assert!(matches!(
        f.fs.access("/w", AccessFlags::R_OK),
        Err(FsError::AccessDenied)
    ));
    f.fs.release(handle).unwrap();

    // Missing paths report the denial, not ENOENT, in write-only mode.
    assert!(matches!(
        f.fs.access("/missing", AccessFlags::R_OK),
        Err(FsError::AccessDenied)
    ));
}

#[test]
fn mkdir_unlink_and_statfs_pass_through() {
    let f = fixture(MountMode::ReadWrite);

    f.fs.mkdir("/d", Mode::from_bits_truncate(0o755)).unwrap();
    assert_eq!(
        f.fs.getattr("/d").unwrap().st_mode & libc::S_IFMT,
        libc::S_IFDIR
    );
    f.fs.rmdir("/d").unwrap();
    assert!(matches!(f.fs.getattr("/d"), Err(FsError::NotFound)));

    let handle = f
        .fs
        .create("/u", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.release(handle).unwrap();
    f.fs.unlink("/u").unwrap();
    assert!(matches!(f.fs.getattr("/u"), Err(FsError::NotFound)));

    assert!(f.fs.statfs().unwrap().block_size() > 0);
}
