// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The filesystem object: path/handle tables, per-operation policy, and the
//! decrypt-on-open / encrypt-on-close flow.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use nix::dir::{self, Dir};
use nix::errno::Errno;
use nix::fcntl::{self, AtFlags, OFlag, SpliceFFlags};
use nix::sys::stat::{self, FchmodatFlags, FileStat, Mode, UtimensatFlags};
use nix::sys::statvfs::{fstatvfs, Statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, AccessFlags, Gid, Uid, UnlinkatFlags};
use tracing::{debug, warn};

use crate::config::{FsConfig, MemoryLock, MountMode};
use crate::error::{FsError, FsResult};
use crate::page_buffer::PageBuffer;
use crate::recipient::Recipient;
use crate::subprocess::Subprocess;

/// Opaque handle identifier returned to the kernel protocol. Monotonically
/// assigned, never reused for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// Entry types surfaced by `readdir`; everything else is suppressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry as reported by `readdir`.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: EntryKind,
}

/// Shared immutable encryption parameters. Open states hold a clone, so the
/// context outlives every handle created under it.
#[derive(Debug)]
struct CryptoContext {
    gpg_path: String,
    recipients: Vec<Recipient>,
}

/// The armored-block terminator delimiting encrypted messages on disk.
const TERMINATOR: &[u8] = b"-----END PGP MESSAGE-----\n";

/// Chunk size for streaming ciphertext through the decryptor.
const CHUNK_SIZE: usize = 1 << 20;

/// Per-open-file data: the backing descriptor and the in-memory plaintext.
struct OpenFile {
    /// `Some` from open until close.
    fd: Option<OwnedFd>,
    flags: OFlag,
    /// Number of logical open handles sharing this state.
    references: u32,
    path: String,
    buffer: PageBuffer,
    /// Whether `buffer` holds the file's plaintext. Set on creation (the
    /// empty file trivially equals the empty buffer) and after a successful
    /// load.
    buffer_set: bool,
    dirty: bool,
    crypto: Arc<CryptoContext>,
}

impl OpenFile {
    fn new(
        fd: OwnedFd,
        flags: OFlag,
        path: String,
        crypto: Arc<CryptoContext>,
        mlock: MemoryLock,
    ) -> Self {
        OpenFile {
            fd: Some(fd),
            flags,
            references: 1,
            path,
            buffer: PageBuffer::new(mlock),
            buffer_set: false,
            dirty: false,
            crypto,
        }
    }

    /// Decrypts the backing ciphertext into the page buffer. A no-op once
    /// the buffer is populated.
    ///
    /// The decryptor does not accept multiple armored blocks in one session,
    /// so the ciphertext is split on the block terminator and each block is
    /// fed to its own child. A failure leaves the buffer cleared and
    /// unpopulated so the load can be retried.
    fn load_buffer(&mut self) -> FsResult<()> {
        if self.buffer_set {
            return Ok(());
        }

        self.dirty = false;
        self.buffer.clear();

        let fd = match self.fd.as_ref() {
            Some(fd) => fd,
            None => return Err(FsError::BadHandle),
        };

        let fd_stat = stat::fstat(fd.as_raw_fd())?;
        if fd_stat.st_size <= 0 {
            self.buffer_set = true;
            return Ok(());
        }
        let fd_size = fd_stat.st_size as usize;

        // SAFETY: the map is read-only and dropped before the descriptor.
        let ciphertext = unsafe { Mmap::map(fd.as_raw_fd()) }.map_err(FsError::Io)?;

        let argv: Vec<String> = vec![
            self.crypto.gpg_path.clone(),
            "--decrypt".to_string(),
            "--no-tty".to_string(),
            "--batch".to_string(),
        ];

        self.buffer_set = true;
        let mut offset = 0;
        while offset < fd_size {
            // Find the end of the current armored block. The terminator is
            // short, so a linear scan is adequate.
            let search_end = fd_size.saturating_sub(TERMINATOR.len());
            let mut block_end = fd_size;
            for candidate in offset..=search_end {
                if &ciphertext[candidate..candidate + TERMINATOR.len()] == TERMINATOR {
                    block_end = candidate + TERMINATOR.len();
                    break;
                }
            }

            let status = if offset == 0 && block_end == fd_size {
                // Single block: wire the backing file straight to the child.
                let mut child =
                    Subprocess::spawn(Some(fd.as_fd()), None, &self.crypto.gpg_path, &argv)?;
                Self::drain_decryptor(&mut self.buffer, &mut child, &[])?;
                child.wait()
            } else {
                let mut child = Subprocess::spawn(None, None, &self.crypto.gpg_path, &argv)?;
                Self::drain_decryptor(&mut self.buffer, &mut child, &ciphertext[offset..block_end])?;
                child.wait()
            };

            if status != 0 {
                warn!(
                    path = %self.path,
                    status,
                    "decryptor failed; leaving the buffer unpopulated"
                );
                self.buffer.clear();
                self.buffer_set = false;
                return Err(FsError::eio());
            }

            offset = block_end;
        }

        Ok(())
    }

    /// Streams `block` into the decryptor while draining its stdout into the
    /// buffer's tail.
    fn drain_decryptor(
        buffer: &mut PageBuffer,
        child: &mut Subprocess,
        mut block: &[u8],
    ) -> FsResult<()> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let (bytes_read, bytes_written) = child.communicate(&mut chunk, block)?;
            block = &block[bytes_written..];
            if bytes_read == 0 {
                break;
            }
            let tail = buffer.size();
            buffer.write(tail, &chunk[..bytes_read])?;
        }
        Ok(())
    }

    /// Flushes the buffer through the encryptor if dirty, then closes the
    /// backing descriptor. Idempotent.
    ///
    /// A non-zero child exit reports `EIO`; the descriptor is closed either
    /// way.
    fn close(&mut self) -> FsResult<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if self.dirty {
            let mut argv: Vec<String> = vec![
                self.crypto.gpg_path.clone(),
                "--encrypt".to_string(),
                "--armor".to_string(),
                "--no-tty".to_string(),
                "--batch".to_string(),
            ];
            for recipient in &self.crypto.recipients {
                argv.push("-r".to_string());
                argv.push(recipient.as_str().to_string());
            }

            match Subprocess::spawn(None, Some(fd.as_fd()), &self.crypto.gpg_path, &argv) {
                Ok(mut child) => {
                    if let Some(stdin) = child.stdin() {
                        if let Err(err) = self.buffer.splice(stdin, SpliceFFlags::empty()) {
                            warn!(path = %self.path, "splice into encryptor failed: {err}");
                        }
                    }
                    if child.wait() != 0 {
                        result = Err(FsError::eio());
                    }
                }
                Err(err) => result = Err(FsError::Io(err)),
            }
            self.dirty = false;
        }

        drop(fd);
        result
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// An open directory stream and the relative path it was opened at.
struct DirState {
    stream: Dir,
    relpath: String,
}

/// Everything the filesystem mutex protects.
struct FsState {
    next_handle: u64,
    crypto: Arc<CryptoContext>,
    /// Logical path -> handle of the open state serving it.
    paths: HashMap<String, HandleId>,
    /// Handle -> open-file state. Consistent with `paths`: a handle appears
    /// there iff it is a key here, under the state's stored path.
    files: HashMap<HandleId, OpenFile>,
    /// Handle -> open directory stream.
    dirs: HashMap<HandleId, DirState>,
}

/// A filesystem presenting a plaintext view of files persisted only as
/// ciphertext under a backing directory.
///
/// All operations serialize on a single mutex, including the blocking I/O
/// through the encryptor and decryptor children; the children are the
/// bottleneck, not lock contention.
pub struct AsymmetricFs {
    root: OwnedFd,
    read: bool,
    memory_lock: MemoryLock,
    state: Mutex<FsState>,
}

impl AsymmetricFs {
    /// Opens the backing directory and assembles the filesystem.
    pub fn new(config: FsConfig) -> FsResult<Self> {
        if config.target.as_os_str().is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let root = fcntl::open(
            &config.target,
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        // SAFETY: `root` is a just-opened, uniquely owned descriptor.
        let root = unsafe { OwnedFd::from_raw_fd(root) };

        Ok(AsymmetricFs {
            root,
            read: config.mode == MountMode::ReadWrite,
            memory_lock: config.memory_lock,
            state: Mutex::new(FsState {
                next_handle: 0,
                crypto: Arc::new(CryptoContext {
                    gpg_path: config.gpg_path,
                    recipients: config.recipients,
                }),
                paths: HashMap::new(),
                files: HashMap::new(),
                dirs: HashMap::new(),
            }),
        })
    }

    /// True when the filesystem is fully configured for mounting.
    pub fn ready(&self) -> bool {
        !self.state.lock().unwrap().crypto.recipients.is_empty()
    }

    /// Replaces the recipient list.
    ///
    /// Open states hold the current crypto context for their whole lifetime,
    /// so this fails while any file handle is open.
    pub fn set_recipients(&self, recipients: Vec<Recipient>) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.files.is_empty() {
            return Err(FsError::Busy);
        }
        let gpg_path = state.crypto.gpg_path.clone();
        state.crypto = Arc::new(CryptoContext {
            gpg_path,
            recipients,
        });
        Ok(())
    }

    fn relpath(path: &str) -> String {
        format!(".{path}")
    }

    fn alloc_handle(state: &mut FsState) -> HandleId {
        let handle = HandleId(state.next_handle);
        state.next_handle += 1;
        handle
    }

    // System utilities such as truncate open the file write-only, which
    // prevents the decrypt-truncate-reencrypt cycle. In read-write mode the
    // backing file is opened read-write regardless of the requested access
    // mode; callers fall back to the requested mode on EACCES.
    fn make_rdwr(&self, flags: OFlag) -> OFlag {
        if !self.read {
            flags
        } else {
            (flags - OFlag::O_ACCMODE) | OFlag::O_RDWR
        }
    }

    pub fn access(&self, path: &str, mode: AccessFlags) -> FsResult<()> {
        if mode.contains(AccessFlags::R_OK) && !self.read {
            // Only a file created through this mount may be read back.
            let state = self.state.lock().unwrap();
            let handle = state.paths.get(path).ok_or(FsError::AccessDenied)?;
            let file = state.files.get(handle).ok_or_else(FsError::eio)?;
            if file.flags.contains(OFlag::O_APPEND) {
                return Err(FsError::AccessDenied);
            }
            if !file.flags.contains(OFlag::O_CREAT) {
                return Err(FsError::AccessDenied);
            }
            // Fall through and let the backing store have the final word.
        }

        let rel = Self::relpath(path);
        unistd::faccessat(Some(self.root.as_raw_fd()), rel.as_str(), mode, AtFlags::empty())?;
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: Mode) -> FsResult<()> {
        let rel = Self::relpath(path);
        stat::fchmodat(Some(self.root.as_raw_fd()), rel.as_str(), mode, FchmodatFlags::FollowSymlink)?;
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: Option<Uid>, gid: Option<Gid>) -> FsResult<()> {
        if uid.is_some_and(|u| u.is_root()) || gid.is_some_and(|g| g.as_raw() == 0) {
            return Err(FsError::NotPermitted);
        }
        let rel = Self::relpath(path);
        unistd::fchownat(Some(self.root.as_raw_fd()), rel.as_str(), uid, gid, AtFlags::empty())?;
        Ok(())
    }

    /// Creates and opens a file, registering (or sharing) its open state.
    pub fn create(&self, path: &str, mode: Mode, flags: OFlag) -> FsResult<HandleId> {
        let rel = Self::relpath(path);
        let flags = flags | OFlag::O_CLOEXEC | OFlag::O_CREAT;

        let fd = match fcntl::openat(Some(self.root.as_raw_fd()), rel.as_str(), self.make_rdwr(flags), mode) {
            Ok(fd) => fd,
            Err(Errno::EACCES) if self.read && flags.contains(OFlag::O_WRONLY) => {
                fcntl::openat(Some(self.root.as_raw_fd()), rel.as_str(), flags, mode)?
            }
            Err(err) => return Err(err.into()),
        };
        // SAFETY: `fd` is a just-opened, uniquely owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut state = self.state.lock().unwrap();
        if let Some(&handle) = state.paths.get(path) {
            if let Some(file) = state.files.get_mut(&handle) {
                file.references += 1;
                return Ok(handle);
            }
        }

        let handle = Self::alloc_handle(&mut state);
        let crypto = Arc::clone(&state.crypto);
        let mut file = OpenFile::new(fd, flags, path.to_string(), crypto, self.memory_lock);
        // A created file starts empty; its empty buffer is authoritative.
        file.buffer_set = true;
        state.paths.insert(path.to_string(), handle);
        state.files.insert(handle, file);
        debug!(path, handle = handle.0, "create");
        Ok(handle)
    }

    /// Opens a file, sharing the open state when the path is already open.
    pub fn open(&self, path: &str, flags: OFlag) -> FsResult<HandleId> {
        let rel = Self::relpath(path);

        let mut state = self.state.lock().unwrap();
        if let Some(&handle) = state.paths.get(path) {
            if let Some(file) = state.files.get_mut(&handle) {
                file.references += 1;
                return Ok(handle);
            }
        }

        let access_mode = flags & OFlag::O_ACCMODE;
        let for_reading = access_mode == OFlag::O_RDWR || access_mode == OFlag::O_RDONLY;
        let for_writing = access_mode == OFlag::O_RDWR || access_mode == OFlag::O_WRONLY;

        let mut flags = flags;
        if !self.read && for_reading && flags.contains(OFlag::O_CREAT) {
            // Reading through "create" must not expose a pre-existing file;
            // require that the file really is new.
            flags |= OFlag::O_EXCL;
        }
        flags |= OFlag::O_CLOEXEC;

        let fd = match fcntl::openat(Some(self.root.as_raw_fd()), rel.as_str(), self.make_rdwr(flags), Mode::empty())
        {
            Ok(fd) => fd,
            Err(Errno::EACCES) if self.read && !for_writing => {
                fcntl::openat(Some(self.root.as_raw_fd()), rel.as_str(), flags, Mode::empty())?
            }
            Err(err) => return Err(err.into()),
        };
        // SAFETY: `fd` is a just-opened, uniquely owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // If the file is empty, treat the empty buffer as initialized so it
        // can be truncated to a nonzero size even in write-only mode.
        // Otherwise decryption is deferred until the first read.
        let buffer_set = match stat::fstat(fd.as_raw_fd()) {
            Ok(st) => st.st_size == 0,
            Err(_) => false,
        };

        let handle = Self::alloc_handle(&mut state);
        let crypto = Arc::clone(&state.crypto);
        let mut file = OpenFile::new(fd, flags, path.to_string(), crypto, self.memory_lock);
        file.buffer_set = buffer_set;
        state.paths.insert(path.to_string(), handle);
        state.files.insert(handle, file);
        debug!(path, handle = handle.0, ?flags, "open");
        Ok(handle)
    }

    pub fn read(&self, handle: HandleId, offset: i64, dst: &mut [u8]) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        let file = state.files.get_mut(&handle).ok_or(FsError::BadHandle)?;

        if offset < 0 {
            return Err(FsError::InvalidArgument);
        }

        if !self.read {
            if !file.buffer_set {
                if file.flags.contains(OFlag::O_APPEND) {
                    // Files open for appending can't be read back.
                    return Err(FsError::AccessDenied);
                }
                if !file.flags.contains(OFlag::O_CREAT) {
                    // O_CREAT implies O_EXCL here, so its absence means the
                    // file predates this handle and cannot be read.
                    return Err(FsError::AccessDenied);
                }
            }
        } else {
            file.load_buffer()?;
        }

        Ok(file.buffer.read(offset as usize, dst))
    }

    pub fn write(&self, handle: HandleId, offset: i64, src: &[u8]) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        let file = state.files.get_mut(&handle).ok_or(FsError::BadHandle)?;

        if src.is_empty() {
            return Ok(0);
        }
        if offset < 0 {
            return Err(FsError::InvalidArgument);
        }

        file.buffer.write(offset as usize, src)?;
        file.dirty = true;
        Ok(src.len())
    }

    /// Stats an open handle, substituting the buffer's logical size.
    pub fn fgetattr(&self, handle: HandleId) -> FsResult<FileStat> {
        let mut state = self.state.lock().unwrap();
        self.stat_handle(&mut state, handle)
    }

    fn stat_handle(&self, state: &mut FsState, handle: HandleId) -> FsResult<FileStat> {
        let file = state.files.get_mut(&handle).ok_or(FsError::BadHandle)?;
        let mut st = {
            let fd = file.fd.as_ref().ok_or(FsError::BadHandle)?;
            stat::fstat(fd.as_raw_fd())?
        };

        if self.read {
            file.load_buffer()?;
        }

        let buffer_size = file.buffer.size() as i64;
        if file.buffer_set {
            st.st_size = buffer_size;
        } else if file.flags.contains(OFlag::O_APPEND) {
            // The unread on-disk content stays; the buffer appends to it.
            st.st_size += buffer_size;
        }
        Ok(st)
    }

    pub fn getattr(&self, path: &str) -> FsResult<FileStat> {
        let mut state = self.state.lock().unwrap();
        if let Some(&handle) = state.paths.get(path) {
            return self.stat_handle(&mut state, handle);
        }

        let rel = Self::relpath(path);
        let mut st = stat::fstatat(Some(self.root.as_raw_fd()), rel.as_str(), AtFlags::AT_SYMLINK_NOFOLLOW)?;
        if !self.read && (st.st_mode & libc::S_IFMT) != libc::S_IFDIR {
            // Nothing under a write-only mount is readable.
            st.st_mode &= !(libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH);
        }
        Ok(st)
    }

    pub fn ftruncate(&self, handle: HandleId, offset: i64) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        self.truncate_handle(&mut state, handle, offset)
    }

    fn truncate_handle(&self, state: &mut FsState, handle: HandleId, offset: i64) -> FsResult<()> {
        let file = state.files.get_mut(&handle).ok_or(FsError::BadHandle)?;

        if offset < 0 {
            Err(FsError::InvalidArgument)
        } else if offset == 0 {
            // Discarding everything is lossless against ciphertext.
            {
                let fd = file.fd.as_ref().ok_or(FsError::BadHandle)?;
                unistd::ftruncate(fd, 0)?;
            }
            file.buffer.resize(0);
            file.dirty = true;
            Ok(())
        } else if self.read {
            // Decrypt, truncate, (lazily) reencrypt.
            file.load_buffer()?;
            file.buffer.resize(offset as usize);
            file.dirty = true;
            Ok(())
        } else {
            // TODO: allow resizing a file this handle created, whose
            // plaintext is fully present even in write-only mode.
            Err(FsError::AccessDenied)
        }
    }

    pub fn truncate(&self, path: &str, offset: i64) -> FsResult<()> {
        let rel = Self::relpath(path);
        if offset < 0 {
            return Err(FsError::InvalidArgument);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(&handle) = state.paths.get(path) {
            return self.truncate_handle(&mut state, handle, offset);
        }

        if offset == 0 {
            let fd = fcntl::openat(
                Some(self.root.as_raw_fd()),
                rel.as_str(),
                OFlag::O_CLOEXEC | OFlag::O_WRONLY,
                Mode::empty(),
            )?;
            // SAFETY: `fd` is a just-opened, uniquely owned descriptor.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            unistd::ftruncate(&fd, 0)?;
            Ok(())
        } else if self.read {
            // Decrypt, truncate, reencrypt through a transient state that
            // never enters the handle tables.
            let fd = fcntl::openat(
                Some(self.root.as_raw_fd()),
                rel.as_str(),
                OFlag::O_CLOEXEC | OFlag::O_RDWR,
                Mode::empty(),
            )?;
            // SAFETY: `fd` is a just-opened, uniquely owned descriptor.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };

            let crypto = Arc::clone(&state.crypto);
            let mut transient = OpenFile::new(
                fd,
                OFlag::O_RDWR,
                path.to_string(),
                crypto,
                self.memory_lock,
            );
            transient.references = 0;
            transient.load_buffer()?;

            // Rewind so the resized ciphertext clobbers the old contents.
            {
                let fd = transient.fd.as_ref().ok_or(FsError::BadHandle)?;
                // SAFETY: lseek has no memory-safety preconditions.
                if unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_SET) } == -1 {
                    return Err(Errno::last().into());
                }
            }

            transient.buffer.resize(offset as usize);
            transient.dirty = true;
            transient.close()
        } else {
            Err(FsError::AccessDenied)
        }
    }

    /// Renames `oldpath` to `newpath`, rewriting the handle tables so an
    /// open state answers for the new name.
    pub fn rename(&self, oldpath: &str, newpath: &str) -> FsResult<()> {
        let rel_old = Self::relpath(oldpath);
        let rel_new = Self::relpath(newpath);

        // Open-file metadata changes iff the backing rename succeeds, so the
        // tables stay locked across the syscall.
        let mut state = self.state.lock().unwrap();
        fcntl::renameat(Some(self.root.as_raw_fd()), rel_old.as_str(), Some(self.root.as_raw_fd()), rel_new.as_str())?;

        if let Some(handle) = state.paths.remove(oldpath) {
            state.paths.insert(newpath.to_string(), handle);
            if let Some(file) = state.files.get_mut(&handle) {
                file.path = newpath.to_string();
            }
        }
        Ok(())
    }

    /// Drops one reference to an open handle; the last drop destroys the
    /// state, flushing first when dirty.
    pub fn release(&self, handle: HandleId) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();

        let last = {
            let Some(file) = state.files.get_mut(&handle) else {
                // Unknown handles are ignored, as the kernel protocol does.
                return Ok(());
            };
            file.references -= 1;
            file.references == 0
        };
        if !last {
            return Ok(());
        }

        let Some(mut file) = state.files.remove(&handle) else {
            return Ok(());
        };
        state.paths.remove(&file.path);
        debug!(path = %file.path, handle = handle.0, dirty = file.dirty, "release");
        file.close()
    }

    /// Validates the handle. Plaintext is only persisted at release.
    pub fn flush(&self, handle: HandleId) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        if state.files.contains_key(&handle) {
            Ok(())
        } else {
            Err(FsError::BadHandle)
        }
    }

    /// Fsyncs the backing descriptor. This pins the current ciphertext; a
    /// dirty buffer is still flushed only at release.
    pub fn fsync(&self, handle: HandleId, _datasync: bool) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        let file = state.files.get(&handle).ok_or(FsError::BadHandle)?;
        let fd = file.fd.as_ref().ok_or(FsError::BadHandle)?;
        unistd::fsync(fd)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: Mode) -> FsResult<()> {
        let rel = Self::relpath(path);
        stat::mkdirat(Some(self.root.as_raw_fd()), rel.as_str(), mode)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let rel = Self::relpath(path);
        unistd::unlinkat(Some(self.root.as_raw_fd()), rel.as_str(), UnlinkatFlags::RemoveDir)?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let rel = Self::relpath(path);
        unistd::unlinkat(Some(self.root.as_raw_fd()), rel.as_str(), UnlinkatFlags::NoRemoveDir)?;
        Ok(())
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> FsResult<()> {
        let rel = Self::relpath(linkpath);
        unistd::symlinkat(target, Some(self.root.as_raw_fd()), rel.as_str())?;
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> FsResult<OsString> {
        let rel = Self::relpath(path);
        Ok(fcntl::readlinkat(Some(self.root.as_raw_fd()), rel.as_str())?)
    }

    pub fn link(&self, _oldpath: &str, _newpath: &str) -> FsResult<()> {
        // asymmetricfs does not support hard links.
        Err(FsError::NotPermitted)
    }

    pub fn utimens(&self, path: &str, atime: &TimeSpec, mtime: &TimeSpec) -> FsResult<()> {
        let rel = Self::relpath(path);
        stat::utimensat(
            Some(self.root.as_raw_fd()),
            rel.as_str(),
            atime,
            mtime,
            UtimensatFlags::FollowSymlink,
        )?;
        Ok(())
    }

    pub fn statfs(&self) -> FsResult<Statvfs> {
        Ok(fstatvfs(&self.root)?)
    }

    // The xattr family operates through an O_PATH descriptor of the entry.
    fn open_path_fd(&self, path: &str) -> FsResult<OwnedFd> {
        let rel = Self::relpath(path);
        Ok(fcntl::openat(
            Some(self.root.as_raw_fd()),
            rel.as_str(),
            OFlag::O_CLOEXEC | OFlag::O_PATH,
            Mode::empty(),
        )?)
    }

    fn xattr_name(name: &str) -> FsResult<CString> {
        CString::new(name).map_err(|_| FsError::InvalidArgument)
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> FsResult<()> {
        let fd = self.open_path_fd(path)?;
        let name = Self::xattr_name(name)?;
        // SAFETY: fd, name, and value outlive the call.
        let ret = unsafe {
            libc::fsetxattr(
                fd.as_raw_fd(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if ret != 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Reads an extended attribute. With an empty `dst`, returns the size
    /// the value requires.
    pub fn getxattr(&self, path: &str, name: &str, dst: &mut [u8]) -> FsResult<usize> {
        let fd = self.open_path_fd(path)?;
        let name = Self::xattr_name(name)?;
        // SAFETY: fd, name, and dst outlive the call.
        let ret = unsafe {
            libc::fgetxattr(
                fd.as_raw_fd(),
                name.as_ptr(),
                dst.as_mut_ptr().cast(),
                dst.len(),
            )
        };
        if ret < 0 {
            return Err(Errno::last().into());
        }
        Ok(ret as usize)
    }

    /// Lists extended attribute names. With an empty `dst`, returns the size
    /// the list requires.
    pub fn listxattr(&self, path: &str, dst: &mut [u8]) -> FsResult<usize> {
        let fd = self.open_path_fd(path)?;
        // SAFETY: fd and dst outlive the call.
        let ret =
            unsafe { libc::flistxattr(fd.as_raw_fd(), dst.as_mut_ptr().cast(), dst.len()) };
        if ret < 0 {
            return Err(Errno::last().into());
        }
        Ok(ret as usize)
    }

    pub fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        let fd = self.open_path_fd(path)?;
        let name = Self::xattr_name(name)?;
        // SAFETY: fd and name outlive the call.
        let ret = unsafe { libc::fremovexattr(fd.as_raw_fd(), name.as_ptr()) };
        if ret != 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    pub fn opendir(&self, path: &str) -> FsResult<HandleId> {
        let rel = Self::relpath(path);
        let stream = Dir::openat(
            Some(self.root.as_raw_fd()),
            rel.as_str(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.dirs.insert(
            handle,
            DirState {
                stream,
                relpath: rel,
            },
        );
        Ok(handle)
    }

    /// Lists the directory behind `handle`.
    ///
    /// Only regular files, directories, and symlinks are surfaced; entries
    /// of unknown type are stat'd to learn their real type first. `.` and
    /// `..` are injected when the underlying stream does not produce them.
    pub fn readdir(&self, handle: HandleId) -> FsResult<Vec<DirEntry>> {
        let mut state = self.state.lock().unwrap();
        let dir = state.dirs.get_mut(&handle).ok_or(FsError::BadHandle)?;
        let relpath = dir.relpath.clone();

        let mut entries = Vec::new();
        let mut saw_dot = false;
        let mut saw_dot_dot = false;

        for entry in dir.stream.iter() {
            let entry = entry.map_err(FsError::from)?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes()).to_os_string();

            let kind = match entry.file_type() {
                Some(dir::Type::File) => EntryKind::File,
                Some(dir::Type::Directory) => EntryKind::Directory,
                Some(dir::Type::Symlink) => EntryKind::Symlink,
                Some(_) => continue,
                None => {
                    // The stream doesn't know; ask the backing store.
                    let full = Path::new(&relpath).join(&name);
                    let st =
                        stat::fstatat(Some(self.root.as_raw_fd()), &full, AtFlags::AT_SYMLINK_NOFOLLOW)?;
                    match st.st_mode & libc::S_IFMT {
                        libc::S_IFREG => EntryKind::File,
                        libc::S_IFDIR => EntryKind::Directory,
                        libc::S_IFLNK => EntryKind::Symlink,
                        _ => continue,
                    }
                }
            };

            if name == "." {
                saw_dot = true;
            } else if name == ".." {
                saw_dot_dot = true;
            }
            entries.push(DirEntry {
                name,
                ino: entry.ino(),
                kind,
            });
        }

        // Some filesystems omit the dot entries; the listing always carries
        // them.
        if !saw_dot {
            entries.push(DirEntry {
                name: OsString::from("."),
                ino: 0,
                kind: EntryKind::Directory,
            });
        }
        if !saw_dot_dot {
            entries.push(DirEntry {
                name: OsString::from(".."),
                ino: 0,
                kind: EntryKind::Directory,
            });
        }

        Ok(entries)
    }

    pub fn releasedir(&self, handle: HandleId) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.dirs.remove(&handle).ok_or(FsError::BadHandle)?;
        Ok(())
    }
}

impl Drop for AsymmetricFs {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if !state.files.is_empty() {
            warn!(
                open = state.files.len(),
                "filesystem dropped with open handles; flushing"
            );
        }
        // OpenFile::drop flushes dirty buffers.
        state.files.clear();
    }
}
