// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test helpers for asymmetricfs.
//!
//! The interesting piece is [`GnupgKey`]: a throwaway GnuPG home directory
//! with one freshly generated, passphrase-less RSA key, for integration
//! tests that drive a real `gpg` binary. [`identity_tool`] installs a tiny
//! stand-in encryptor for tests that only care about filesystem semantics,
//! and [`open_descriptors`] enumerates the process's file descriptors for
//! leak checks.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use asymmetricfs_core::Subprocess;

/// Parameters for a generated test key.
#[derive(Clone, Debug)]
pub struct KeySpecification {
    pub key_size: u32,
    pub name: String,
    pub email: String,
    pub comment: String,
}

impl Default for KeySpecification {
    fn default() -> Self {
        KeySpecification {
            key_size: 2048,
            name: "Testing".to_string(),
            email: "test@example.com".to_string(),
            comment: String::new(),
        }
    }
}

/// Errors raised while driving the gpg binary.
#[derive(Debug)]
pub struct GnupgError(String);

impl fmt::Display for GnupgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for GnupgError {}

fn args(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| s.to_string()).collect()
}

/// Runs `program` with the given arguments, feeding `input` and collecting
/// stdout. Fails on a non-zero exit.
fn run(program: &str, argv: &[String], input: &[u8]) -> Result<Vec<u8>, GnupgError> {
    let mut child = Subprocess::spawn(None, None, program, argv)
        .map_err(|err| GnupgError(format!("unable to start {program}: {err}")))?;

    let mut output = Vec::new();
    let mut chunk = vec![0u8; 1 << 16];
    let mut remaining = input;
    loop {
        let (bytes_read, bytes_written) = child
            .communicate(&mut chunk, remaining)
            .map_err(|err| GnupgError(format!("unable to communicate with {program}: {err}")))?;
        remaining = &remaining[bytes_written..];
        if bytes_read == 0 {
            break;
        }
        output.extend_from_slice(&chunk[..bytes_read]);
    }

    let status = child.wait();
    if status != 0 {
        return Err(GnupgError(format!("{program} exited with status {status}")));
    }
    Ok(output)
}

/// The version of the gpg binary on `PATH`, or `None` when there is none.
///
/// Tests that need real encryption call this first and skip when it fails.
pub fn gpg_version() -> Option<(u32, u32, u32)> {
    let output = run("gpg", &args(&["gpg", "--version"]), &[]).ok()?;
    let text = String::from_utf8_lossy(&output);

    // Expected leading line: "gpg (GnuPG) 2.4.4"
    let first = text.lines().next()?;
    let version = first.rsplit(' ').next()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let maintenance = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, maintenance))
}

/// A freshly generated key in a throwaway GnuPG home directory.
///
/// The home directory is deleted when the value is dropped. Point
/// `GNUPGHOME` at [`GnupgKey::home`] so child gpg invocations can see the
/// key.
pub struct GnupgKey {
    home: TempDir,
    fingerprint: String,
}

impl GnupgKey {
    pub fn generate(spec: &KeySpecification) -> Result<Self, GnupgError> {
        let home = TempDir::new()
            .map_err(|err| GnupgError(format!("unable to create gpg home: {err}")))?;
        // gpg insists on a private home directory.
        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700))
            .map_err(|err| GnupgError(format!("unable to restrict gpg home: {err}")))?;

        let mut batch = String::new();
        batch.push_str("Key-Type: RSA\n");
        batch.push_str(&format!("Key-Length: {}\n", spec.key_size));
        if !spec.name.is_empty() {
            batch.push_str(&format!("Name-Real: {}\n", spec.name));
        }
        if !spec.email.is_empty() {
            batch.push_str(&format!("Name-Email: {}\n", spec.email));
        }
        if !spec.comment.is_empty() {
            batch.push_str(&format!("Name-Comment: {}\n", spec.comment));
        }
        batch.push_str("%no-protection\n");
        batch.push_str("%transient-key\n");
        batch.push_str("%commit\n");

        let home_str = home.path().display().to_string();
        run(
            "gpg",
            &args(&[
                "gpg",
                "--homedir",
                &home_str,
                "--gen-key",
                "--batch",
                "--no-tty",
                "--no-permission-warning",
            ]),
            batch.as_bytes(),
        )?;

        // Machine-readable listing: the fpr line carries the fingerprint in
        // field 10.
        let listing = run(
            "gpg",
            &args(&[
                "gpg",
                "--homedir",
                &home_str,
                "--no-permission-warning",
                "--list-keys",
                "--with-colons",
            ]),
            &[],
        )?;
        let listing = String::from_utf8_lossy(&listing).to_string();
        let fingerprint = listing
            .lines()
            .find(|line| line.starts_with("fpr:"))
            .and_then(|line| line.split(':').nth(9))
            .map(str::to_string)
            .ok_or_else(|| GnupgError("unable to locate key fingerprint".to_string()))?;

        // Mark the key ultimately trusted so encryption needs no prompt.
        let trust = format!("{fingerprint}:6:\n");
        run(
            "gpg",
            &args(&[
                "gpg",
                "--homedir",
                &home_str,
                "--no-permission-warning",
                "--import-ownertrust",
            ]),
            trust.as_bytes(),
        )?;

        Ok(GnupgKey { home, fingerprint })
    }

    /// The GnuPG home directory holding the key.
    pub fn home(&self) -> &Path {
        self.home.path()
    }

    /// The full key fingerprint, usable as a recipient.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The 16-hex-digit key id (the fingerprint's tail).
    pub fn key_id(&self) -> &str {
        let tail = self.fingerprint.len().saturating_sub(16);
        &self.fingerprint[tail..]
    }
}

/// Installs a stand-in encryption tool in `dir` and returns its path.
///
/// The tool copies stdin to stdout regardless of arguments, so "encryption"
/// and "decryption" are both the identity and a loaded file never contains
/// an armored-block terminator. Filesystem tests that don't care about real
/// cryptography use it to run without a key ring.
pub fn identity_tool(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join("identity-gpg");
    fs::write(&path, "#!/bin/sh\nexec cat\n")?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Installs a stand-in tool that always fails, for error-path tests.
pub fn failing_tool(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join("failing-gpg");
    fs::write(&path, "#!/bin/sh\nexit 2\n")?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Enumerates this process's open descriptors as `(fd, target)` pairs.
pub fn open_descriptors() -> io::Result<Vec<(i32, String)>> {
    let mut descriptors = Vec::new();
    for entry in fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let target = fs::read_link(entry.path())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        descriptors.push((fd, target));
    }
    descriptors.sort_by_key(|(fd, _)| *fd);
    Ok(descriptors)
}
