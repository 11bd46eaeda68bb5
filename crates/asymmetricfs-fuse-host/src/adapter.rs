// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! FUSE adapter mapping the inode-keyed kernel protocol onto the path- and
//! handle-keyed core.
//!
//! The adapter owns the inode↔path tables; every other decision (access
//! policy, sizes, encryption) belongs to [`AsymmetricFs`]. Errors cross the
//! boundary as negated errnos via [`FsError::errno`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EINVAL, ENOENT, EPERM};
use nix::fcntl::OFlag;
use nix::sys::stat::{FileStat, Mode};
use nix::sys::time::TimeSpec;
use nix::unistd::{AccessFlags, Gid, Uid};
use tracing::debug;

use asymmetricfs_core::{AsymmetricFs, EntryKind, FsError, FsResult, HandleId};

const TTL: Duration = Duration::from_secs(1);

pub struct AsymmetricFuse {
    core: AsymmetricFs,
    /// inode -> logical path ("/" rooted).
    paths: HashMap<u64, String>,
    /// logical path -> inode.
    inodes: HashMap<String, u64>,
    next_ino: u64,
}

impl AsymmetricFuse {
    pub fn new(core: AsymmetricFs) -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(FUSE_ROOT_ID, "/".to_string());
        inodes.insert("/".to_string(), FUSE_ROOT_ID);
        AsymmetricFuse {
            core,
            paths,
            inodes,
            next_ino: FUSE_ROOT_ID + 1,
        }
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.inodes.remove(path) {
            self.paths.remove(&ino);
        }
    }

    fn move_path(&mut self, old: &str, new: &str) {
        self.forget_path(new);
        if let Some(ino) = self.inodes.remove(old) {
            self.paths.insert(ino, new.to_string());
            self.inodes.insert(new.to_string(), ino);
        }
    }

    /// Joins a parent inode and entry name into a logical path. Fails on
    /// unknown parents and non-UTF-8 names.
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.paths.get(&parent)?;
        let name = name.to_str()?;
        Some(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        })
    }

    fn attr_from_stat(&mut self, path: &str, st: &FileStat) -> FileAttr {
        let ino = self.ino_for(path);
        stat_to_attr(ino, st)
    }
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn stat_to_attr(ino: u64, st: &FileStat) -> FileAttr {
    let kind = match st.st_mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };

    FileAttr {
        ino,
        size: st.st_size.max(0) as u64,
        blocks: st.st_blocks.max(0) as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind,
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn entry_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    }
}

fn time_or_now(time: TimeOrNow) -> TimeSpec {
    match time {
        TimeOrNow::SpecificTime(at) => {
            let since = at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
            TimeSpec::new(since.as_secs() as i64, since.subsec_nanos() as i64)
        }
        TimeOrNow::Now => TimeSpec::new(0, libc::UTIME_NOW),
    }
}

fn errno(err: &FsError) -> c_int {
    err.errno()
}

impl Filesystem for AsymmetricFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.getattr(&path) {
            Ok(st) => {
                let attr = self.attr_from_stat(&path, &st);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        if let Some(fh) = fh {
            match self.core.fgetattr(HandleId(fh)) {
                Ok(st) => reply.attr(&TTL, &stat_to_attr(ino, &st)),
                Err(err) => reply.error(errno(&err)),
            }
            return;
        }

        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &stat_to_attr(ino, &st)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };

        let result: FsResult<()> = (|| {
            if let Some(mode) = mode {
                self.core.chmod(&path, Mode::from_bits_truncate(mode))?;
            }

            if uid.is_some() || gid.is_some() {
                self.core
                    .chown(&path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
            }

            if let Some(size) = size {
                match fh {
                    Some(fh) => self.core.ftruncate(HandleId(fh), size as i64)?,
                    None => self.core.truncate(&path, size as i64)?,
                }
            }

            if atime.is_some() || mtime.is_some() {
                let omit = TimeSpec::new(0, libc::UTIME_OMIT);
                let atime = atime.map_or(omit, time_or_now);
                let mtime = mtime.map_or(omit, time_or_now);
                self.core.utimens(&path, &atime, &mtime)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            reply.error(errno(&err));
            return;
        }

        let stat = match fh {
            Some(fh) => self.core.fgetattr(HandleId(fh)),
            None => self.core.getattr(&path),
        };
        match stat {
            Ok(st) => reply.attr(&TTL, &stat_to_attr(ino, &st)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.readlink(&path) {
            Ok(target) => reply.data(target.as_encoded_bytes()),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let mode = Mode::from_bits_truncate(mode & !umask);
        match self.core.mkdir(&path, mode).and_then(|()| self.core.getattr(&path)) {
            Ok(st) => {
                let attr = self.attr_from_stat(&path, &st);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(ENOENT);
            return;
        };
        let Some(target) = target.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self
            .core
            .symlink(target, &path)
            .and_then(|()| self.core.getattr(&path))
        {
            Ok(st) => {
                let attr = self.attr_from_stat(&path, &st);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old), Some(new)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.rename(&old, &new) {
            Ok(()) => {
                self.move_path(&old, &new);
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(EPERM);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.open(&path, OFlag::from_bits_truncate(flags)) {
            Ok(handle) => reply.opened(handle.0, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let mode = Mode::from_bits_truncate(mode & !umask);
        let handle = match self.core.create(&path, mode, OFlag::from_bits_truncate(flags)) {
            Ok(handle) => handle,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        match self.core.fgetattr(handle) {
            Ok(st) => {
                let attr = self.attr_from_stat(&path, &st);
                debug!(path, handle = handle.0, "created");
                reply.created(&TTL, &attr, 0, handle.0, 0);
            }
            Err(err) => {
                let _ = self.core.release(handle);
                reply.error(errno(&err));
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut buf = vec![0u8; size as usize];
        match self.core.read(HandleId(fh), offset, &mut buf) {
            Ok(bytes_read) => {
                buf.truncate(bytes_read);
                reply.data(&buf);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.core.write(HandleId(fh), offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.core.flush(HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.core.release(HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.core.fsync(HandleId(fh), datasync) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.opendir(&path) {
            Ok(handle) => reply.opened(handle.0, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.core.readdir(HandleId(fh)) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        for (index, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let entry_ino = if entry.name == "." || entry.name == ".." {
                ino
            } else {
                match entry.name.to_str().and_then(|name| {
                    self.paths
                        .get(&ino)
                        .cloned()
                        .map(|parent| (parent, name.to_string()))
                }) {
                    Some((parent, name)) => {
                        let path = if parent == "/" {
                            format!("/{name}")
                        } else {
                            format!("{parent}/{name}")
                        };
                        self.ino_for(&path)
                    }
                    None => entry.ino.max(1),
                }
            };

            if reply.add(
                entry_ino,
                (index + 1) as i64,
                entry_type(entry.kind),
                &entry.name,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.core.releasedir(HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.core.statfs() {
            Ok(vfs) => reply.statfs(
                vfs.blocks(),
                vfs.blocks_free(),
                vfs.blocks_available(),
                vfs.files(),
                vfs.files_free(),
                vfs.block_size() as u32,
                vfs.name_max() as u32,
                vfs.fragment_size() as u32,
            ),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(path), Some(name)) = (self.path_for(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (Some(path), Some(name)) = (self.path_for(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        if size == 0 {
            match self.core.getxattr(&path, name, &mut []) {
                Ok(len) => reply.size(len as u32),
                Err(err) => reply.error(errno(&err)),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match self.core.getxattr(&path, name, &mut buf) {
            Ok(len) => reply.data(&buf[..len]),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        if size == 0 {
            match self.core.listxattr(&path, &mut []) {
                Ok(len) => reply.size(len as u32),
                Err(err) => reply.error(errno(&err)),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match self.core.listxattr(&path, &mut buf) {
            Ok(len) => reply.data(&buf[..len]),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(path), Some(name)) = (self.path_for(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.core.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self
            .core
            .access(&path, AccessFlags::from_bits_truncate(mask))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }
}
