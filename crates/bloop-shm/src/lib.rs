//! Shared-buffer management for bloop devices.
//!
//! The driver side owns a [`SharedArena`]: one memfd-backed region per
//! helper binding, carved into page-granular segments, one segment per
//! in-flight request. The helper maps the same memfd once at attach
//! ([`HelperArena`]) and reports its base address back, which lets the
//! driver hand out helper-local buffer addresses in request frames.

use mmap::{MapOption, MemoryMap};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::ptr;
use tracing::trace;

const PAGE_SIZE: usize = 4096;

/// Shared-memory error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShmErrorKind {
    /// Backing region could not be created or has no free segment.
    OutOfMemory,
    /// Mapping could not be created or no helper mapping is registered.
    MappingFailed,
    /// A copy could not be satisfied from the supplied buffer.
    Io,
}

/// Errors surfaced by [`SharedArena`] and [`HelperArena`].
#[derive(Clone, Debug)]
pub struct ShmError {
    kind: ShmErrorKind,
    message: Option<String>,
}

impl ShmError {
    pub fn new(kind: ShmErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ShmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ShmErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {msg}", self.kind),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for ShmError {}

pub type ShmResult<T> = std::result::Result<T, ShmError>;

/// One segment of the arena, sized for a single request's data.
///
/// Not cloneable: the segment is returned to the arena exactly once,
/// through [`SharedArena::release`] or [`SharedArena::release_unmapped`].
#[derive(Debug)]
pub struct SharedBuffer {
    offset: usize,
    len: usize,
    cap: usize,
}

impl SharedBuffer {
    /// Logical byte length of the buffer (the request's transfer size).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Helper-local address of a [`SharedBuffer`], valid for one binding.
#[derive(Debug)]
pub struct HelperMapping {
    addr: u64,
}

impl HelperMapping {
    pub fn address(&self) -> u64 {
        self.addr
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Segment {
    offset: usize,
    len: usize,
}

/// Driver-side shared memory arena for one helper binding.
pub struct SharedArena {
    fd: OwnedFd,
    map: MemoryMap,
    len: usize,
    /// Free segments, sorted by offset, adjacent segments coalesced.
    free: Vec<Segment>,
    helper_base: Option<u64>,
}

// The raw mapping pointer is only touched through &self/&mut self and the
// region outlives the map.
unsafe impl Send for SharedArena {}

impl SharedArena {
    /// Create an arena of at least `len` bytes, rounded up to page size.
    pub fn create(len: usize) -> ShmResult<Self> {
        if len == 0 {
            return Err(ShmError::with_message(
                ShmErrorKind::OutOfMemory,
                "arena length must be non-zero",
            ));
        }
        let len = round_up(len);
        let fd = memfd_create(c"bloop-arena", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|err| ShmError::with_message(ShmErrorKind::OutOfMemory, err.to_string()))?;
        ftruncate(&fd, len as i64)
            .map_err(|err| ShmError::with_message(ShmErrorKind::OutOfMemory, err.to_string()))?;
        let map = map_shared(fd.as_raw_fd(), len)?;
        Ok(Self {
            fd,
            map,
            len,
            free: vec![Segment { offset: 0, len }],
            helper_base: None,
        })
    }

    /// Total arena capacity in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// File descriptor to pass to the helper during the attach handshake.
    pub fn fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// Record where the helper mapped the arena in its address space.
    pub fn set_helper_base(&mut self, base: u64) {
        self.helper_base = Some(base);
    }

    /// Allocate a zero-initialized segment of `len` logical bytes.
    pub fn allocate(&mut self, len: usize) -> ShmResult<SharedBuffer> {
        let cap = round_up(len.max(1));
        let slot = self
            .free
            .iter()
            .position(|seg| seg.len >= cap)
            .ok_or_else(|| {
                ShmError::with_message(
                    ShmErrorKind::OutOfMemory,
                    format!("no free arena segment of {cap} bytes"),
                )
            })?;
        let seg = self.free[slot];
        if seg.len == cap {
            self.free.remove(slot);
        } else {
            self.free[slot] = Segment {
                offset: seg.offset + cap,
                len: seg.len - cap,
            };
        }
        // Segments are recycled across requests; scrub before reuse.
        unsafe {
            ptr::write_bytes(self.map.data().add(seg.offset), 0, cap);
        }
        trace!(offset = seg.offset, len, cap, "arena segment allocated");
        Ok(SharedBuffer {
            offset: seg.offset,
            len,
            cap,
        })
    }

    /// Compute the helper-local address for `buffer`.
    ///
    /// Fails with [`ShmErrorKind::MappingFailed`] when no helper mapping
    /// has been registered for this arena.
    pub fn map_into_helper(&self, buffer: &SharedBuffer) -> ShmResult<HelperMapping> {
        let base = self.helper_base.ok_or_else(|| {
            ShmError::with_message(ShmErrorKind::MappingFailed, "no helper mapping registered")
        })?;
        Ok(HelperMapping {
            addr: base + buffer.offset as u64,
        })
    }

    /// Copy caller data into the shared segment (write requests, before
    /// dispatch). The source must supply exactly the buffer's length.
    pub fn copy_in(&mut self, buffer: &SharedBuffer, source: &[u8]) -> ShmResult<()> {
        if source.len() != buffer.len {
            return Err(ShmError::with_message(
                ShmErrorKind::Io,
                format!(
                    "source supplied {} bytes, buffer needs {}",
                    source.len(),
                    buffer.len
                ),
            ));
        }
        unsafe {
            ptr::copy_nonoverlapping(
                source.as_ptr(),
                self.map.data().add(buffer.offset),
                source.len(),
            );
        }
        Ok(())
    }

    /// Copy shared-segment contents back out (read requests, on
    /// completion). The destination must accept exactly the buffer's
    /// length.
    pub fn copy_out(&self, dest: &mut [u8], buffer: &SharedBuffer) -> ShmResult<()> {
        if dest.len() != buffer.len {
            return Err(ShmError::with_message(
                ShmErrorKind::Io,
                format!(
                    "destination holds {} bytes, buffer has {}",
                    dest.len(),
                    buffer.len
                ),
            ));
        }
        unsafe {
            ptr::copy_nonoverlapping(
                self.map.data().add(buffer.offset),
                dest.as_mut_ptr(),
                dest.len(),
            );
        }
        Ok(())
    }

    /// Release a buffer and its helper mapping. Called exactly once per
    /// request, on its terminal event; enforced by move semantics.
    pub fn release(&mut self, buffer: SharedBuffer, mapping: HelperMapping) {
        drop(mapping);
        self.release_unmapped(buffer);
    }

    /// Release a buffer that was never mapped into the helper (create
    /// error paths).
    pub fn release_unmapped(&mut self, buffer: SharedBuffer) {
        trace!(
            offset = buffer.offset,
            cap = buffer.cap,
            "arena segment released"
        );
        self.insert_free(Segment {
            offset: buffer.offset,
            len: buffer.cap,
        });
    }

    /// Bytes currently available for allocation (diagnostics).
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|seg| seg.len).sum()
    }

    fn insert_free(&mut self, seg: Segment) {
        let idx = self
            .free
            .iter()
            .position(|s| s.offset > seg.offset)
            .unwrap_or(self.free.len());
        self.free.insert(idx, seg);
        // Coalesce with the next, then the previous, neighbour.
        if idx + 1 < self.free.len() && self.free[idx].offset + self.free[idx].len == self.free[idx + 1].offset
        {
            self.free[idx].len += self.free[idx + 1].len;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].offset + self.free[idx - 1].len == self.free[idx].offset {
            self.free[idx - 1].len += self.free[idx].len;
            self.free.remove(idx);
        }
    }
}

/// Helper-side view of the arena received during the attach handshake.
pub struct HelperArena {
    _fd: OwnedFd,
    map: MemoryMap,
    len: usize,
}

unsafe impl Send for HelperArena {}

impl HelperArena {
    /// Map the arena memfd received from the driver.
    pub fn map(fd: OwnedFd, len: usize) -> ShmResult<Self> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(ShmError::with_message(
                ShmErrorKind::MappingFailed,
                "arena length must be a non-zero page multiple",
            ));
        }
        let map = map_shared(fd.as_raw_fd(), len)?;
        Ok(Self { _fd: fd, map, len })
    }

    /// Base address of the mapping, reported back to the driver.
    pub fn base(&self) -> u64 {
        self.map.data() as u64
    }

    /// Resolve a request's buffer address to a mutable slice.
    ///
    /// Rejects addresses outside the mapped window; a frame carrying one
    /// is corrupt or stale.
    pub fn segment_mut(&mut self, addr: u64, len: usize) -> ShmResult<&mut [u8]> {
        let base = self.base();
        let end = base + self.len as u64;
        let within = addr >= base && addr.checked_add(len as u64).is_some_and(|top| top <= end);
        if !within {
            return Err(ShmError::with_message(
                ShmErrorKind::Io,
                format!("buffer address {addr:#x}+{len} outside arena window"),
            ));
        }
        let offset = (addr - base) as usize;
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                self.map.data().add(offset),
                len,
            ))
        }
    }
}

fn map_shared(fd: i32, len: usize) -> ShmResult<MemoryMap> {
    MemoryMap::new(
        len,
        &[
            MapOption::MapReadable,
            MapOption::MapWritable,
            MapOption::MapFd(fd),
            MapOption::MapNonStandardFlags(libc::MAP_SHARED),
        ],
    )
    .map_err(|err| ShmError::with_message(ShmErrorKind::MappingFailed, err.to_string()))
}

fn round_up(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}
