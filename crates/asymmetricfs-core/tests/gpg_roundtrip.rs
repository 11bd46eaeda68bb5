// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end tests against a real gpg binary.
//!
//! Each test generates a throwaway key in a temporary GnuPG home and points
//! `GNUPGHOME` at it, so the filesystem's child invocations can find the key
//! ring. The environment variable is process-wide; a lock serializes the
//! tests. Everything here skips with a notice when no usable gpg exists.

use std::fs;
use std::sync::Mutex;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tempfile::TempDir;

use asymmetricfs_core::{
    AsymmetricFs, FsConfig, FsError, MemoryLock, MountMode, Recipient,
};
use asymmetricfs_test_utils::{gpg_version, GnupgKey, KeySpecification};

static GNUPGHOME_LOCK: Mutex<()> = Mutex::new(());

const ARMOR_HEADER: &[u8] = b"-----BEGIN PGP MESSAGE-----";
const ARMOR_FOOTER: &str = "-----END PGP MESSAGE-----\n";

struct GpgFixture {
    backing: TempDir,
    _key: GnupgKey,
    fs: AsymmetricFs,
    previous_home: Option<std::ffi::OsString>,
}

impl GpgFixture {
    fn new(mode: MountMode) -> Option<Self> {
        if gpg_version().is_none() {
            eprintln!("skipping: no usable gpg on PATH");
            return None;
        }

        let key = match GnupgKey::generate(&KeySpecification::default()) {
            Ok(key) => key,
            Err(err) => {
                eprintln!("skipping: key generation failed: {err}");
                return None;
            }
        };

        let previous_home = std::env::var_os("GNUPGHOME");
        std::env::set_var("GNUPGHOME", key.home());

        let recipient = match Recipient::validate("gpg", key.fingerprint()) {
            Ok(recipient) => recipient,
            Err(_) => {
                eprintln!("skipping: generated key was not accepted as a recipient");
                match previous_home {
                    Some(home) => std::env::set_var("GNUPGHOME", home),
                    None => std::env::remove_var("GNUPGHOME"),
                }
                return None;
            }
        };

        let backing = TempDir::new().unwrap();
        let config = FsConfig {
            target: backing.path().to_path_buf(),
            mode,
            recipients: vec![recipient],
            gpg_path: "gpg".to_string(),
            memory_lock: MemoryLock::None,
        };
        let fs = AsymmetricFs::new(config).unwrap();
        assert!(fs.ready());

        Some(GpgFixture {
            backing,
            _key: key,
            fs,
            previous_home,
        })
    }
}

impl Drop for GpgFixture {
    fn drop(&mut self) {
        match &self.previous_home {
            Some(home) => std::env::set_var("GNUPGHOME", home),
            None => std::env::remove_var("GNUPGHOME"),
        }
    }
}

fn read_all(fs: &AsymmetricFs, handle: asymmetricfs_core::HandleId) -> Vec<u8> {
    let mut buf = vec![0u8; 1 << 16];
    let n = fs.read(handle, 0, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn round_trip_through_real_ciphertext() {
    let _guard = GNUPGHOME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(f) = GpgFixture::new(MountMode::ReadWrite) else {
        return;
    };

    let handle = f
        .fs
        .create("/test", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();
    f.fs.release(handle).unwrap();

    // The backing store holds an armored message, not the plaintext.
    let ciphertext = fs::read(f.backing.path().join("test")).unwrap();
    assert!(ciphertext.starts_with(ARMOR_HEADER));
    assert!(String::from_utf8_lossy(&ciphertext).contains(ARMOR_FOOTER));
    assert!(!ciphertext.windows(7).any(|w| w == b"abcdefg".as_slice()));

    let handle = f.fs.open("/test", OFlag::O_RDONLY).unwrap();
    assert_eq!(read_all(&f.fs, handle), b"abcdefg");
    f.fs.release(handle).unwrap();
}

#[test]
fn append_produces_and_reads_multiple_blocks() {
    let _guard = GNUPGHOME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(f) = GpgFixture::new(MountMode::ReadWrite) else {
        return;
    };

    let handle = f
        .fs
        .create("/t", Mode::from_bits_truncate(0o600), OFlag::O_RDWR)
        .unwrap();
    f.fs.write(handle, 0, b"abcdefg").unwrap();
    f.fs.release(handle).unwrap();

    let handle = f
        .fs
        .open("/t", OFlag::O_APPEND | OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"hijklmn").unwrap();
    f.fs.release(handle).unwrap();

    // Two independent armored blocks were concatenated on disk.
    let ciphertext = fs::read_to_string(f.backing.path().join("t")).unwrap();
    assert_eq!(ciphertext.matches(ARMOR_FOOTER).count(), 2);

    // Loading decrypts and concatenates both blocks.
    let handle = f.fs.open("/t", OFlag::O_RDONLY).unwrap();
    assert_eq!(read_all(&f.fs, handle), b"abcdefghijklmn");
    f.fs.release(handle).unwrap();
}

#[test]
fn write_only_mode_still_encrypts() {
    let _guard = GNUPGHOME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(f) = GpgFixture::new(MountMode::WriteOnly) else {
        return;
    };

    let handle = f
        .fs
        .create("/wo", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.write(handle, 0, b"sensitive").unwrap();
    f.fs.release(handle).unwrap();

    let ciphertext = fs::read(f.backing.path().join("wo")).unwrap();
    assert!(ciphertext.starts_with(ARMOR_HEADER));

    let handle = f.fs.open("/wo", OFlag::O_RDONLY).unwrap();
    let mut buf = [0u8; 32];
    assert!(matches!(
        f.fs.read(handle, 0, &mut buf),
        Err(FsError::AccessDenied)
    ));
    f.fs.release(handle).unwrap();
}

#[test]
fn empty_backing_files_load_as_empty() {
    let _guard = GNUPGHOME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(f) = GpgFixture::new(MountMode::ReadWrite) else {
        return;
    };

    let handle = f
        .fs
        .create("/empty", Mode::from_bits_truncate(0o600), OFlag::O_WRONLY)
        .unwrap();
    f.fs.release(handle).unwrap();

    // No writes, no encryptor run: the artifact is a zero-byte file.
    assert_eq!(
        fs::metadata(f.backing.path().join("empty")).unwrap().len(),
        0
    );

    let handle = f.fs.open("/empty", OFlag::O_RDONLY).unwrap();
    assert_eq!(read_all(&f.fs, handle), b"");
    f.fs.release(handle).unwrap();
}

#[test]
fn recipient_validation_against_a_real_key_ring() {
    let _guard = GNUPGHOME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if gpg_version().is_none() {
        eprintln!("skipping: no usable gpg on PATH");
        return;
    }
    let key = match GnupgKey::generate(&KeySpecification::default()) {
        Ok(key) => key,
        Err(err) => {
            eprintln!("skipping: key generation failed: {err}");
            return;
        }
    };

    let previous = std::env::var_os("GNUPGHOME");
    std::env::set_var("GNUPGHOME", key.home());

    assert!(Recipient::validate("gpg", key.fingerprint()).is_ok());
    assert!(Recipient::validate("gpg", key.key_id()).is_ok());
    assert!(Recipient::validate("gpg", "nobody@invalid.example").is_err());

    match previous {
        Some(home) => std::env::set_var("GNUPGHOME", home),
        None => std::env::remove_var("GNUPGHOME"),
    }
}
