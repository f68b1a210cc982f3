//! A secure-memory container for secret key material, built on the
//! [Sodium](https://libsodium.org) cryptographic library.
//!
//! Keys, seeds, and other secrets need more care than ordinary data while they live in memory:
//! they should never be swapped to disk, never end up in a core dump, never be left behind in
//! freed memory, and any stray read or write past the end of the buffer should be caught rather
//! than silently corrupting (or leaking) the secret. This crate provides [`SecureKey`], a
//! variable-length key container which takes all of these measures, and which additionally lets
//! you lock its contents down entirely while the key is not in use.
//!
//! # Access States
//! A [`SecureKey`] is always in one of three [access states](AccessState):
//! * [`AccessState::ReadWrite`]: The key can be read and modified.
//! * [`AccessState::ReadOnly`]: The key can be read, but any write will terminate the process.
//! * [`AccessState::NoAccess`]: Any access to the key will terminate the process.
//!
//! These states are enforced by the hardware, using the operating system's page protection
//! facilities (`mprotect`). An access violation is *not* a recoverable error: the process is
//! killed by the operating system. It is therefore a good idea to be as restrictive as possible
//! with key material, calling [`SecureKey::no_access`] whenever a key is not needed for a while.
//!
//! # Guarded Memory
//! The bytes of a [`SecureKey`] are stored in a [`guarded::GuardedRegion`]: a set of memory pages,
//! locked into physical memory, bracketed by inaccessible guard pages, and preceded by a canary.
//! The key bytes are placed directly before the trailing guard page, so an overflow traps
//! immediately, while the canary is checked whenever the region's protection changes and when it
//! is released, so that underflows are detected too. On release, the region is always zeroed.
//!
//! # Which API Should I Use?
//! I want to...
//! * Generate a random key
//!     * Use [`SecureKey::new`]
//! * Derive a key from a password
//!     * Use [`SecureKey::new_uninitialized`] then [`SecureKey::derive_from_password`]
//! * Store key material produced by some other function (e.g: a keypair generator)
//!     * Use [`SecureKey::generate_with`] or [`SecureKey::from_derived_bytes`]
//! * Compare buffers, or zero them, without timing side-channels
//!     * Use [`mem`]
//! * Generate cryptographically secure random data
//!     * Use [`random`]
//!
//! # Examples
//! ```rust
//! use keyguard::{sizes, SecureKey};
//!
//! let mut key = SecureKey::new(sizes::KEYSIZE_SECRETBOX).unwrap();
//! assert_eq!(key.len(), sizes::KEYSIZE_SECRETBOX);
//!
//! // We don't need the key for a while: make sure nothing can read it.
//! key.no_access();
//!
//! // ...
//!
//! key.read_only();
//! let copy = key.duplicate().unwrap();
//! assert!(key == copy);
//!
//! // Both keys are zeroed and released when they go out of scope.
//! ```
//!
//! # Threads
//! A [`SecureKey`] has a single owner and no internal synchronisation. Every access-state
//! transition requires `&mut self`, so a key shared between threads by reference can only ever be
//! read. If several threads need to change the state of the same key, wrap it in a `Mutex`.

use libsodium_sys as sodium;
use thiserror::Error;

pub mod guarded;
pub mod key;
pub mod mem;
pub mod pwhash;
pub mod random;
pub mod sizes;

pub use key::{AccessState, SecureKey};
pub use pwhash::Strength;

/// General error type used in keyguard.
///
/// This type is returned by functions which can possibly fail throughout keyguard. Note that the
/// fatal failure modes of this crate (access violations, canary corruption) are never reported
/// through this type: they terminate the process.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum KeyguardError {
    /// Failed to initialise Sodium.
    ///
    /// This corresponds to a call to `sodium_init` returning -1, indicating initialisation
    /// failure. In such a case, Sodium is unsafe to use.
    #[error("failed to initialise libsodium")]
    SodiumInitFailed,

    /// An error occurred while allocating guarded memory, see [`guarded::AllocError`].
    #[error("guarded memory allocation failed")]
    Allocation(#[from] guarded::AllocError),

    /// An error occurred in the [`pwhash`] module.
    #[error("key derivation error")]
    Derivation(#[from] pwhash::DerivationError),

    /// Tried to copy between two keys of different lengths, see [`SecureKey::copy_from`].
    #[error("key length mismatch: expected {expected}, found {found}")]
    LengthMismatch {
        /// The length of the destination key.
        expected: usize,
        /// The length of the source key.
        found: usize,
    },
}

/// Attempt to initialise Sodium.
///
/// This function should be called in any scenario where a function from Sodium will be used
/// internally. Returns `Ok(0)` if Sodium was initialised successfully, `Ok(1)` if Sodium has
/// already been initialised, or [`KeyguardError::SodiumInitFailed`] if the initialisation was
/// unsuccessful.
pub(crate) fn require_init() -> Result<libc::c_int, KeyguardError> {
    let init_status = unsafe {
        // SAFETY: This function can safely be called multiple times from multiple threads. Once it
        // has been called, all other Sodium functions are also thread-safe.
        sodium::sodium_init()
    };

    // sodium_init() returns -1 on init failure, 0 on success, or 1 if Sodium is already
    // initialised
    if init_status < 0 {
        tracing::error!("sodium_init() failed");
        return Err(KeyguardError::SodiumInitFailed);
    }

    Ok(init_status)
}
