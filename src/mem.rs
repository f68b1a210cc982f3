//! Constant-time memory utilities.
//!
//! This module contains wrappers around Sodium's [helper
//! functions](https://doc.libsodium.org/helpers) for comparing and erasing memory.
//!
//! Comparing secret values with the standard `==` operator on slices is dangerous: the comparison
//! returns as soon as the first differing byte is found, so the time it takes reveals how long a
//! prefix the two values share. An attacker able to measure this can recover a secret byte by
//! byte. The functions in this module always touch every byte of their inputs, so their running
//! time only depends on the length of the inputs, not on their contents.
//!
//! Similarly, erasing a buffer with a plain loop (or `fill(0)`) just before it is freed is a write
//! the compiler is free to remove, since nothing reads the buffer afterwards. [`clear`] uses an
//! erasure routine which the compiler will not optimise away.

use crate::{require_init, KeyguardError};
use libsodium_sys as sodium;

/// Constant time test for equality of two slices.
///
/// This function tests whether two byte slices contain the same contents. For the same input size,
/// the time taken to compare the slices is always identical. Returns true if the slices contain
/// the same contents, false otherwise. Always returns false if the slices are not of the same
/// length.
pub fn eq(a: &[u8], b: &[u8]) -> Result<bool, KeyguardError> {
    require_init()?;

    Ok(ct_eq(a, b))
}

/// Constant time equality, without initialising Sodium first.
///
/// `sodium_memcmp` does not depend on any state set up by `sodium_init`, so this is usable from
/// contexts which cannot report an initialisation failure (`PartialEq`, canary checks).
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let comparison_result = unsafe {
        // SAFETY: This function expects two pointers to regions of memory of the same length,
        // specified by the third parameter. We check above to ensure that a and b are of the same
        // length. We use a.len() to specify the length, so it is correct for these slices. This
        // function will not modify the contents of either slice.
        sodium::sodium_memcmp(
            a.as_ptr() as *const libc::c_void,
            b.as_ptr() as *const libc::c_void,
            a.len(),
        )
    };

    comparison_result == 0
}

/// Zero the contents of `buf`.
///
/// After sensitive data is no longer required, it should be cleared from memory. However, since
/// memory is often not accessed after being cleared, compilers may remove the operation to erase
/// the memory as part of the optimisation process. This function zeroes the memory in such a way
/// that the compiler will not remove the operation.
pub fn clear(buf: &mut [u8]) -> Result<(), KeyguardError> {
    require_init()?;

    unsafe {
        // SAFETY: `buf` is a valid, writable slice of `buf.len()` bytes, and all zeroes is a valid
        // representation of a u8 slice.
        wipe(buf.as_mut_ptr(), buf.len());
    }

    Ok(())
}

/// Test whether `buf` is filled entirely with zeroes, in constant-time for a specific length.
///
/// Returns true if `buf` is filled with all-zeroes, false otherwise. This function will always
/// take the same number of operations to perform the check for a specific length of `buf`.
pub fn is_zero(buf: &[u8]) -> Result<bool, KeyguardError> {
    require_init()?;

    let comparison_result = unsafe {
        // SAFETY: This function expects a pointer to a region of memory, and a number of bytes to
        // test for being zero. We use `buf.len()` as the number of bytes to check, which is the
        // size of `buf` in bytes, so this is correct for this pointer.
        sodium::sodium_is_zero(buf.as_ptr(), buf.len())
    };

    Ok(comparison_result != 0)
}

/// Zero `len` bytes starting at `ptr`, without being optimised away.
///
/// Unlike [`clear`], this does not call `sodium_init`: it is used on release paths (drop), which
/// are only reachable once Sodium has been initialised to allocate the memory in the first place.
///
/// # Safety
/// `ptr` must be valid for writes of `len` bytes.
pub(crate) unsafe fn wipe(ptr: *mut u8, len: usize) {
    // SAFETY: This function expects a pointer to a region of memory, and a number of bytes to
    // clear starting at that pointer. The caller guarantees `ptr` is valid for writes of `len`
    // bytes.
    sodium::sodium_memzero(ptr as *mut libc::c_void, len);
}
