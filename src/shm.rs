//! Shared-memory frame ring.
//!
//! A named POSIX shared-memory region of `slots * frame_bytes` bytes. The
//! session creates it and is the only party allowed to unlink it; the
//! engine process attaches by name and writes one slot per iteration.
//! Readers only touch a slot after its index has been published, so the
//! single-writer/many-reader discipline holds across the process boundary.

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

/// Build the region name for a session: `/{prefix}-{id}`.
///
/// POSIX requires a leading slash and no other slashes; session ids are
/// validated upstream to the safe alphabet.
pub fn region_name(prefix: &str, session_id: &str) -> String {
    format!("/{prefix}-{session_id}")
}

#[derive(Debug)]
pub struct ShmRing {
    ptr: NonNull<c_void>,
    len: usize,
    slots: usize,
    frame_bytes: usize,
    name: String,
    owner: bool,
    unlinked: AtomicBool,
}

// One writer (the engine, in another process) and read-only views on this
// side. The mapping itself is plain bytes; consistency is provided by the
// publish-then-read protocol, not by the type system.
unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Create a fresh region. Fails with `AlreadyExists` if the name is
    /// taken; callers decide whether a stale region may be reclaimed.
    pub fn create(name: &str, slots: usize, frame_bytes: usize) -> io::Result<Self> {
        let len = Self::region_len(slots, frame_bytes)?;
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(io::Error::from)?;

        if let Err(e) = ftruncate(&fd, len as i64) {
            let _ = shm_unlink(name);
            return Err(io::Error::from(e));
        }

        match Self::map(&fd, len, name, slots, frame_bytes, true) {
            Ok(ring) => Ok(ring),
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Attach to an existing region by name.
    pub fn attach(name: &str, slots: usize, frame_bytes: usize) -> io::Result<Self> {
        let len = Self::region_len(slots, frame_bytes)?;
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(io::Error::from)?;
        Self::map(&fd, len, name, slots, frame_bytes, false)
    }

    fn region_len(slots: usize, frame_bytes: usize) -> io::Result<usize> {
        if slots < 2 || frame_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring needs at least 2 slots and a nonzero frame size",
            ));
        }
        slots.checked_mul(frame_bytes).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "ring size overflows usize")
        })
    }

    fn map(
        fd: &std::os::fd::OwnedFd,
        len: usize,
        name: &str,
        slots: usize,
        frame_bytes: usize,
        owner: bool,
    ) -> io::Result<Self> {
        let nz_len = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length region"))?;
        let ptr = unsafe {
            mmap(
                None,
                nz_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(io::Error::from)?;

        Ok(Self {
            ptr,
            len,
            slots,
            frame_bytes,
            name: name.to_string(),
            owner,
            unlinked: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Read-only view of one slot, without copying.
    pub fn slot(&self, index: usize) -> &[u8] {
        assert!(index < self.slots, "slot index out of range");
        unsafe {
            slice::from_raw_parts(
                self.ptr.as_ptr().cast::<u8>().add(index * self.frame_bytes),
                self.frame_bytes,
            )
        }
    }

    /// Writable view of one slot (engine side).
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.slots, "slot index out of range");
        unsafe {
            slice::from_raw_parts_mut(
                self.ptr.as_ptr().cast::<u8>().add(index * self.frame_bytes),
                self.frame_bytes,
            )
        }
    }

    /// Remove the name from the system. Owner-only, idempotent; attached
    /// mappings (including the engine's) stay valid until unmapped.
    pub fn unlink(&self) {
        if self.owner && !self.unlinked.swap(true, Ordering::SeqCst) {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                tracing::debug!("[ShmRing] unlink {}: {}", self.name, e);
            }
        }
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
        // Backstop; the session normally unlinks explicitly on close.
        self.unlink();
    }
}
