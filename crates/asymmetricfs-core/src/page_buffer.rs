// Copyright 2026 The asymmetricfs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sparse, page-aligned in-memory plaintext buffers.

use std::collections::BTreeMap;
use std::io::IoSlice;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::{vmsplice, SpliceFFlags};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::unistd;
use tracing::warn;

use crate::config::MemoryLock;
use crate::error::{FsError, FsResult};

/// Returns the system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Maximum number of entries accepted per scatter-gather call.
fn max_iov() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    if n > 0 {
        n as usize
    } else {
        1024
    }
}

/// A page-aligned, page-multiple anonymous mapping, unmapped on drop.
///
/// Under `MemoryLock::All` or `MemoryLock::Buffers` the mapping is created
/// page-locked; if the lock cannot be satisfied the allocation fails with an
/// out-of-memory condition.
pub struct PageAllocation {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned and carries no thread affinity.
unsafe impl Send for PageAllocation {}

impl PageAllocation {
    /// Allocates `len` bytes; `len` must be a positive multiple of the page
    /// size.
    pub fn new(len: usize, mlock: MemoryLock) -> FsResult<Self> {
        let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        match mlock {
            MemoryLock::All | MemoryLock::Buffers => flags |= MapFlags::MAP_LOCKED,
            MemoryLock::None => {}
        }

        let length = NonZeroUsize::new(len).ok_or(FsError::InvalidArgument)?;
        // SAFETY: anonymous mapping with no backing file descriptor.
        let ptr = unsafe {
            mman::mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )
        }
        .map_err(|_| FsError::OutOfMemory)?;

        Ok(PageAllocation { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is live, readable, and `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is live, writable, and `len` bytes long.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for PageAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping this instance owns.
        if let Err(err) = unsafe { mman::munmap(self.ptr, self.len) } {
            warn!("munmap of {} bytes failed: {err}", self.len);
        }
    }
}

// Iteratively vmsplices the io-vector, resuming from the first
// partially-consumed entry after each short write.
fn flush_iov(
    fd: BorrowedFd<'_>,
    ios: &mut [IoSlice<'_>],
    flags: SpliceFFlags,
) -> nix::Result<()> {
    let mut ios = ios;
    while !ios.is_empty() {
        let written = vmsplice(fd, ios, flags)?;
        if written == 0 {
            break;
        }
        IoSlice::advance_slices(&mut ios, written);
    }
    Ok(())
}

fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        match unistd::write(fd, buf) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// The sparse in-memory plaintext contents of one file.
///
/// Contents live in page-aligned allocations keyed by their base offset;
/// bytes below the logical size that no allocation covers read as zero.
pub struct PageBuffer {
    allocations: BTreeMap<usize, PageAllocation>,
    page_size: usize,
    size: usize,
    mlock: MemoryLock,
}

impl PageBuffer {
    pub fn new(mlock: MemoryLock) -> Self {
        PageBuffer {
            allocations: BTreeMap::new(),
            page_size: page_size(),
            size: 0,
            mlock,
        }
    }

    /// Exact size of the buffer's contents in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn round_down_to_page(&self, n: usize) -> usize {
        n & !(self.page_size - 1)
    }

    fn round_up_to_page(&self, n: usize) -> usize {
        (n + self.page_size - 1) & !(self.page_size - 1)
    }

    fn is_page_multiple(&self, n: usize) -> bool {
        self.round_down_to_page(n) == n
    }

    /// Reads up to `dst.len()` bytes at `offset`, zero-filling holes.
    ///
    /// Returns the number of bytes delivered; bytes of `dst` past the return
    /// value are left untouched.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        let n = if offset < self.size {
            dst.len().min(self.size - offset)
        } else {
            0
        };

        let base = self.round_down_to_page(offset);
        let start = self
            .allocations
            .range(..=base)
            .next_back()
            .map(|(block_base, _)| *block_base)
            .unwrap_or(0);

        let mut position = 0;
        for (&block_base, block) in self.allocations.range(start..) {
            if block_base >= offset + n {
                break;
            }

            if block_base > offset + position {
                // Zero-fill the gap before this allocation.
                let gap = block_base - offset - position;
                dst[position..position + gap].fill(0);
                position += gap;
            }

            let internal_offset = offset + position - block_base;
            if internal_offset >= block.len() {
                continue;
            }

            let internal_len = (block.len() - internal_offset).min(n - position);
            dst[position..position + internal_len]
                .copy_from_slice(&block.as_slice()[internal_offset..internal_offset + internal_len]);
            position += internal_len;
        }

        // Zero-fill the tail.
        if position < n {
            dst[position..n].fill(0);
            position = n;
        }

        position
    }

    /// Writes `src` at `offset`, acquiring pages as needed.
    ///
    /// The logical size grows to cover the write; it never shrinks. On
    /// allocation failure the error is returned and no further bytes are
    /// copied.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> FsResult<()> {
        let n = src.len();
        let mut position = 0;

        while position < n {
            let base = self.round_down_to_page(offset + position);

            // Predecessor search: the covering allocation may begin below
            // `base` when it spans multiple pages.
            let covering = self
                .allocations
                .range(..=base)
                .next_back()
                .filter(|(block_base, block)| *block_base + block.len() > base)
                .map(|(block_base, _)| *block_base);

            let block_base = match covering {
                Some(block_base) => block_base,
                None => {
                    // Extend to the next allocation or the rounded end of the
                    // write, whichever comes first.
                    let write_end = self.round_up_to_page(offset + n);
                    let end = self
                        .allocations
                        .range(base..)
                        .next()
                        .map(|(next_base, _)| *next_base)
                        .map_or(write_end, |next_base| next_base.min(write_end));
                    debug_assert!(end > base);
                    debug_assert!(self.is_page_multiple(end - base));

                    let allocation = PageAllocation::new(end - base, self.mlock)?;
                    self.allocations.insert(base, allocation);
                    base
                }
            };

            let block = self
                .allocations
                .get_mut(&block_base)
                .expect("covering allocation was just located");
            let internal_offset = offset + position - block_base;
            let internal_len = (block.len() - internal_offset).min(n - position);
            block.as_mut_slice()[internal_offset..internal_offset + internal_len]
                .copy_from_slice(&src[position..position + internal_len]);

            position += internal_len;
            self.size = self.size.max(offset + position);
        }

        Ok(())
    }

    /// Resizes the buffer to `n` bytes.
    ///
    /// Shrinking drops every allocation whose base lies at or past `n`;
    /// allocations straddling `n` are kept intact, their excess logically
    /// invisible.
    pub fn resize(&mut self, n: usize) {
        if self.size > n {
            self.allocations.split_off(&n);
        }
        self.size = n;
    }

    /// Drops all contents.
    pub fn clear(&mut self) {
        self.allocations.clear();
        self.size = 0;
    }

    /// Splices the buffer's entire contents into `fd`.
    ///
    /// Whole pages move through the scatter-gather zero-copy primitive, with
    /// holes filled by splicing a reusable zeroed allocation; the partial
    /// final page falls back to an ordinary write. Returns the total number
    /// of bytes transferred.
    pub fn splice(&self, fd: BorrowedFd<'_>, flags: SpliceFFlags) -> nix::Result<usize> {
        let last_whole_page = self.round_down_to_page(self.size);
        let iov_max = max_iov();

        let mut position = 0;
        let mut blocks = self.allocations.iter().peekable();
        while position < last_whole_page {
            let Some(&(&block_base, _)) = blocks.peek() else {
                break;
            };

            if position < block_base {
                let gap = block_base - position;
                debug_assert!(self.is_page_multiple(gap));
                self.zero_splice(fd, gap, flags)?;
                position += gap;
            }

            // Gather contiguous allocations into one io-vector.
            let mut ios: Vec<IoSlice<'_>> = Vec::new();
            while ios.len() < iov_max {
                let Some(&(&block_base, block)) = blocks.peek() else {
                    break;
                };
                if position < block_base {
                    break;
                }

                let internal_len = block.len().min(last_whole_page - position);
                if internal_len == 0 {
                    break;
                }
                ios.push(IoSlice::new(&block.as_slice()[..internal_len]));
                position += internal_len;
                if position == last_whole_page {
                    // Retain the block: the tail may still need it.
                    break;
                }
                blocks.next();
            }

            flush_iov(fd, &mut ios, flags)?;
        }

        // A trailing hole (from a growing resize) still owes zeros.
        if position < last_whole_page {
            let gap = last_whole_page - position;
            self.zero_splice(fd, gap, flags)?;
            position += gap;
        }

        // If anything remains, write it normally.
        if last_whole_page < self.size {
            let tail_len = self.size - last_whole_page;
            let covering = self
                .allocations
                .range(..=last_whole_page)
                .next_back()
                .filter(|(block_base, block)| *block_base + block.len() > last_whole_page);

            match covering {
                Some((&block_base, block)) => {
                    let internal_offset = last_whole_page - block_base;
                    write_all(
                        fd,
                        &block.as_slice()[internal_offset..internal_offset + tail_len],
                    )?;
                }
                None => {
                    let zeros = vec![0u8; tail_len];
                    write_all(fd, &zeros)?;
                }
            }
            position += tail_len;
        }

        Ok(position)
    }

    // Splices `size` bytes of zeros into `fd` from a reusable scratch
    // allocation.
    fn zero_splice(&self, fd: BorrowedFd<'_>, size: usize, flags: SpliceFFlags) -> nix::Result<()> {
        // The scratch pages are reused, so gifting them is never safe.
        let flags = flags - SpliceFFlags::SPLICE_F_GIFT;

        const MAX_ALLOCATION: usize = 1 << 20;
        let allocation_len = self
            .round_up_to_page(size.min(MAX_ALLOCATION))
            .max(self.page_size);
        let scratch =
            PageAllocation::new(allocation_len, MemoryLock::None).map_err(|_| Errno::ENOMEM)?;

        let iov_max = max_iov();
        let mut position = 0;
        while position < size {
            let mut ios: Vec<IoSlice<'_>> = Vec::new();
            while ios.len() < iov_max && position < size {
                let len = scratch.len().min(size - position);
                ios.push(IoSlice::new(&scratch.as_slice()[..len]));
                position += len;
            }
            flush_iov(fd, &mut ios, flags)?;
        }

        Ok(())
    }
}
