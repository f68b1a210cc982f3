//! Guarded, page-locked memory regions.
//!
//! Due to the nature of modern computing, it is often difficult to ensure that once a key is no
//! longer required, it is truly unrecoverable. If we store a key on the heap while we perform some
//! cryptographic operation, then free the associated memory when done, the memory it occupied will
//! not be erased, only marked as free. The page holding it may have been swapped to disk in the
//! meantime, or end up in a core dump. And a bug elsewhere in the process which reads or writes
//! out of bounds of some unrelated buffer may silently read (or corrupt) the key.
//!
//! A [`GuardedRegion`] takes a number of measures against these problems:
//! * The region is mapped as whole pages, directly from the operating system, and is bracketed by
//!   two guard pages which can never be accessed. The bytes handed out are placed at the very end
//!   of the data pages, directly before the trailing guard page, so that reading or writing even a
//!   single byte past the end of the region traps the process.
//! * A canary is placed directly before the bytes handed out. It is checked whenever the region's
//!   protection changes, and when the region is released: if it has been modified, a buffer
//!   underflow has occurred, and the process is aborted.
//! * The data pages are locked into physical memory (`mlock`), so they will not be swapped to
//!   disk, and on Linux they are excluded from core dumps.
//! * The protection of the data pages can be changed between [no access](AccessState::NoAccess),
//!   [read-only](AccessState::ReadOnly), and [read-write](AccessState::ReadWrite). Accessing the
//!   region in a way its current protection forbids is caught by the hardware, and terminates the
//!   process.
//! * When released, the data pages are always zeroed before being returned to the operating
//!   system, whatever their protection was at the time.
//!
//! These measures are not free: every region costs at least three pages of address space, one of
//! which is locked, and locked memory is usually limited per-process (see `RLIMIT_MEMLOCK`). So
//! this is not a general-purpose allocator, it should only be used for secret material.
//!
//! Failure to set any of these protections up is reported as an [`AllocError`]: there is never a
//! silent fallback to unprotected memory. On platforms without page protection facilities,
//! [`GuardedRegion::allocate`] always fails with [`AllocError::Unsupported`].

use crate::{mem, require_init, KeyguardError};
use libsodium_sys as sodium;
use std::ptr::NonNull;
use thiserror::Error;

/// The length of the canary placed before every guarded region, in bytes.
pub const CANARY_LENGTH: usize = 16;

lazy_static::lazy_static! {
    /// The size of a virtual memory page on this system.
    pub static ref PAGE_SIZE: usize = sys::page_size();

    /// The process-wide canary value, generated once from the system CSPRNG.
    static ref CANARY: [u8; CANARY_LENGTH] = {
        let mut canary = [0u8; CANARY_LENGTH];
        unsafe {
            // SAFETY: This function expects a pointer to which random data will be written, and
            // the number of bytes to write. `canary` is valid for writes of `CANARY_LENGTH` bytes.
            // The canary is only ever generated from `GuardedRegion::allocate`, after Sodium has
            // been initialised.
            sodium::randombytes_buf(canary.as_mut_ptr() as *mut libc::c_void, CANARY_LENGTH);
        }
        canary
    };
}

/// Error type returned if a guarded region could not be allocated.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum AllocError {
    /// The requested size, once rounded up to whole pages and with guard pages added, does not fit
    /// in the address space.
    #[error("requested size is too large for a guarded region")]
    SizeOverflow,

    /// The operating system failed to map the pages for the region (out of memory).
    #[error("failed to map memory for guarded region")]
    Map,

    /// The guard pages bracketing the region could not be made inaccessible.
    #[error("failed to set up guard pages")]
    GuardPage,

    /// The data pages could not be locked into physical memory.
    ///
    /// This usually means the process has exhausted its locked memory limit (`RLIMIT_MEMLOCK`).
    #[error("failed to lock guarded region into memory")]
    Lock,

    /// Guarded memory is not available on this platform.
    #[error("guarded memory is not supported on this platform")]
    Unsupported,
}

/// The access permissions currently enforced on a guarded region.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "use-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum AccessState {
    /// Any read or write terminates the process.
    NoAccess,

    /// Reads are allowed, any write terminates the process.
    ReadOnly,

    /// Reads and writes are allowed.
    ReadWrite,
}

impl AccessState {
    /// Returns true if memory in this state may be read.
    pub const fn is_readable(self) -> bool {
        !matches!(self, AccessState::NoAccess)
    }

    /// Returns true if memory in this state may be written.
    pub const fn is_writable(self) -> bool {
        matches!(self, AccessState::ReadWrite)
    }
}

/// A region of guarded, page-locked memory.
///
/// See the [module-level documentation](self) for the protections a region provides. A region is
/// released (zeroed, unlocked, and unmapped) exactly once, when it is dropped or passed to
/// [`GuardedRegion::release`].
pub struct GuardedRegion {
    /// Start of the mapping (the leading guard page).
    base: NonNull<u8>,
    /// Length of the whole mapping, including both guard pages.
    mapped_len: usize,
    /// Start of the locked data pages.
    data: NonNull<u8>,
    /// Length of the data pages.
    data_len: usize,
    /// Start of the bytes handed out, flush against the trailing guard page.
    ptr: NonNull<u8>,
    len: usize,
    state: AccessState,
}

// SAFETY: A `GuardedRegion` exclusively owns its mapping, and the pointers it stores are never
// shared with another region. Moving it to another thread moves that ownership.
unsafe impl Send for GuardedRegion {}

// SAFETY: Every method which writes to the region or changes its protection takes `&mut self`, so
// shared references only allow reads.
unsafe impl Sync for GuardedRegion {}

impl GuardedRegion {
    /// Allocate a guarded region of `len` bytes.
    ///
    /// The region is zero-filled, and starts out [read-write](AccessState::ReadWrite).
    ///
    /// Returns an [`AllocError`] if the region could not be mapped, if its guard pages could not be
    /// set up, if it could not be locked into memory, or if guarded memory is not supported on
    /// this platform. A failed allocation never leaves anything mapped.
    pub fn allocate(len: usize) -> Result<Self, KeyguardError> {
        require_init()?;

        if !sys::SUPPORTED {
            return Err(AllocError::Unsupported.into());
        }

        let page = *PAGE_SIZE;
        let data_len = len
            .checked_add(CANARY_LENGTH)
            .and_then(|l| l.checked_next_multiple_of(page))
            .ok_or(AllocError::SizeOverflow)?;
        let mapped_len = data_len
            .checked_add(2 * page)
            .ok_or(AllocError::SizeOverflow)?;

        let base = unsafe {
            // SAFETY: Mapping fresh anonymous memory has no preconditions. The mapping is always
            // unmapped again, either below on failure, or when the region is released.
            sys::map(mapped_len)
        }
        .ok_or(AllocError::Map)?;

        unsafe {
            // SAFETY: `base` points to the start of a mapping of `mapped_len` bytes, which is
            // `page + data_len + page`. The leading guard page starts at `base`, the data pages at
            // `base + page`, and the trailing guard page at `base + page + data_len`; all three
            // ranges lie within the mapping, and all three offsets are multiples of the page size.
            let data = NonNull::new_unchecked(base.as_ptr().add(page));
            let trailing_guard = data.as_ptr().add(data_len);

            if !sys::protect(base.as_ptr(), page, AccessState::NoAccess)
                || !sys::protect(trailing_guard, page, AccessState::NoAccess)
            {
                sys::unmap(base.as_ptr(), mapped_len);
                return Err(AllocError::GuardPage.into());
            }

            if !sys::lock(data.as_ptr(), data_len) {
                sys::unmap(base.as_ptr(), mapped_len);
                tracing::debug!(len, data_len, "mlock() failed for guarded region");
                return Err(AllocError::Lock.into());
            }

            if !sys::exclude_from_dumps(data.as_ptr(), data_len) {
                tracing::warn!(data_len, "could not exclude guarded region from core dumps");
            }

            // We verified above `data_len >= len + CANARY_LENGTH`, so both the user bytes and the
            // canary preceding them lie within the data pages.
            let ptr = NonNull::new_unchecked(trailing_guard.sub(len));
            std::ptr::copy_nonoverlapping(
                CANARY.as_ptr(),
                ptr.as_ptr().sub(CANARY_LENGTH),
                CANARY_LENGTH,
            );

            tracing::debug!(len, pages = data_len / page, "allocated guarded region");

            Ok(Self {
                base,
                mapped_len,
                data,
                data_len,
                ptr,
                len,
                state: AccessState::ReadWrite,
            })
        }
    }

    /// Release this region.
    ///
    /// The region is made writable, its canary is verified, its data pages are zeroed, and the
    /// pages are then unlocked and returned to the operating system. This is exactly what happens
    /// when a region is dropped; this method just makes the release explicit at the call site.
    pub fn release(self) {
        drop(self)
    }

    /// Make this region inaccessible: any further read or write terminates the process.
    pub fn set_no_access(&mut self) {
        self.set_access_state(AccessState::NoAccess)
    }

    /// Make this region read-only: any further write terminates the process.
    pub fn set_read_only(&mut self) {
        self.set_access_state(AccessState::ReadOnly)
    }

    /// Make this region readable and writable.
    pub fn set_read_write(&mut self) {
        self.set_access_state(AccessState::ReadWrite)
    }

    /// Change the protection of this region to `state`.
    ///
    /// If the region is currently readable, its canary is verified first, and the process is
    /// aborted if the canary has been modified. The process is also aborted if the operating system
    /// refuses to change the protection.
    pub fn set_access_state(&mut self, state: AccessState) {
        if self.state.is_readable() {
            self.verify_canary();
        }

        let changed = unsafe {
            // SAFETY: `self.data` points to `self.data_len` bytes of page-aligned memory within
            // our own mapping, so changing its protection cannot affect any other allocation.
            sys::protect(self.data.as_ptr(), self.data_len, state)
        };

        if !changed {
            tracing::error!(from = ?self.state, to = ?state, "mprotect() failed on guarded region");
            std::process::abort();
        }

        tracing::trace!(from = ?self.state, to = ?state, "changed guarded region protection");
        self.state = state;
    }

    /// The protection currently enforced on this region.
    pub fn access_state(&self) -> AccessState {
        self.state
    }

    /// The number of usable bytes in this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if this region has no usable bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a raw pointer to the start of the usable bytes.
    ///
    /// The pointer is valid for the lifetime of the region. Whether it may be read from depends on
    /// the region's current [`AccessState`].
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Returns a raw mutable pointer to the start of the usable bytes.
    ///
    /// The pointer is valid for the lifetime of the region. Whether it may be written to depends
    /// on the region's current [`AccessState`].
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the usable bytes of this region as a slice.
    ///
    /// # Safety
    /// The region must be [readable](AccessState::is_readable) for as long as the returned slice
    /// is used. Reading from the slice while the region is [`AccessState::NoAccess`] terminates the
    /// process.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Returns the usable bytes of this region as a mutable slice.
    ///
    /// # Safety
    /// The region must be [writable](AccessState::is_writable) for as long as the returned slice
    /// is used. Writing to the slice while the region is read-only or inaccessible terminates the
    /// process.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }

    /// Check the canary preceding the usable bytes, aborting the process if it has been modified.
    ///
    /// Must only be called while the region is readable.
    fn verify_canary(&self) {
        let canary = unsafe {
            // SAFETY: The canary occupies the `CANARY_LENGTH` bytes directly before `self.ptr`,
            // within the data pages, which the caller guarantees are currently readable.
            std::slice::from_raw_parts(self.ptr.as_ptr().sub(CANARY_LENGTH), CANARY_LENGTH)
        };

        if !mem::ct_eq(canary, &CANARY[..]) {
            tracing::error!(len = self.len, "guarded region canary corrupted, aborting");
            std::process::abort();
        }
    }
}

impl Drop for GuardedRegion {
    fn drop(&mut self) {
        // We do not use `require_init` here, as it must be called to allocate the region.

        if !self.state.is_writable() {
            self.set_read_write();
        }
        self.verify_canary();

        unsafe {
            // SAFETY:
            // * The data pages are `self.data_len` bytes starting at `self.data`, within our own
            //   mapping, and we have just made them writable.
            // * `self.base` and `self.mapped_len` describe exactly the mapping created in
            //   `allocate`. `drop` is called exactly once, and after it no method of the region is
            //   reachable, so neither a double-unmap nor a use-after-unmap is possible in safe
            //   code.
            mem::wipe(self.data.as_ptr(), self.data_len);

            if !sys::unlock(self.data.as_ptr(), self.data_len) {
                tracing::warn!(len = self.len, "munlock() failed on guarded region");
            }
            if !sys::unmap(self.base.as_ptr(), self.mapped_len) {
                tracing::warn!(len = self.len, "munmap() failed on guarded region");
            }
        }

        tracing::debug!(len = self.len, "released guarded region");
    }
}

impl std::fmt::Debug for GuardedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedRegion")
            .field("len", &self.len)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Pointer for GuardedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        <NonNull<u8> as std::fmt::Pointer>::fmt(&self.ptr, f)
    }
}

/// Thin wrappers around the OS page management calls. Each returns whether the call succeeded.
#[cfg(unix)]
mod sys {
    use super::AccessState;
    use std::ptr::NonNull;

    pub(super) const SUPPORTED: bool = true;

    pub(super) fn page_size() -> usize {
        let size = unsafe {
            // SAFETY: `sysconf` has no memory safety preconditions.
            libc::sysconf(libc::_SC_PAGESIZE)
        };

        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub(super) unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(ptr as *mut u8)
        }
    }

    pub(super) unsafe fn unmap(ptr: *mut u8, len: usize) -> bool {
        libc::munmap(ptr as *mut libc::c_void, len) == 0
    }

    pub(super) unsafe fn protect(ptr: *mut u8, len: usize, state: AccessState) -> bool {
        let prot = match state {
            AccessState::NoAccess => libc::PROT_NONE,
            AccessState::ReadOnly => libc::PROT_READ,
            AccessState::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        libc::mprotect(ptr as *mut libc::c_void, len, prot) == 0
    }

    pub(super) unsafe fn lock(ptr: *mut u8, len: usize) -> bool {
        libc::mlock(ptr as *const libc::c_void, len) == 0
    }

    pub(super) unsafe fn unlock(ptr: *mut u8, len: usize) -> bool {
        libc::munlock(ptr as *const libc::c_void, len) == 0
    }

    #[cfg(target_os = "linux")]
    pub(super) unsafe fn exclude_from_dumps(ptr: *mut u8, len: usize) -> bool {
        libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTDUMP) == 0
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) unsafe fn exclude_from_dumps(_ptr: *mut u8, _len: usize) -> bool {
        true
    }
}

#[cfg(not(unix))]
mod sys {
    use super::AccessState;
    use std::ptr::NonNull;

    pub(super) const SUPPORTED: bool = false;

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) unsafe fn map(_len: usize) -> Option<NonNull<u8>> {
        None
    }

    pub(super) unsafe fn unmap(_ptr: *mut u8, _len: usize) -> bool {
        false
    }

    pub(super) unsafe fn protect(_ptr: *mut u8, _len: usize, _state: AccessState) -> bool {
        false
    }

    pub(super) unsafe fn lock(_ptr: *mut u8, _len: usize) -> bool {
        false
    }

    pub(super) unsafe fn unlock(_ptr: *mut u8, _len: usize) -> bool {
        false
    }

    pub(super) unsafe fn exclude_from_dumps(_ptr: *mut u8, _len: usize) -> bool {
        false
    }
}
