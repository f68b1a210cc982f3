//! The [`SecureKey`] container.
//!
//! A [`SecureKey`] owns a variable-length buffer of secret bytes, stored in a
//! [`GuardedRegion`]. See the [crate-level documentation](crate) for an overview of access states
//! and what the guarded memory protects against.
//!
//! # Lifecycle
//! ```text
//!                 new_uninitialized()            new() / initialize()
//!                         |                      derive_from_password()
//!                         v                              |
//!     destroy() ---> ReadWrite <------ read_write() ---- v
//!                         |  ------ read_only() ----> ReadOnly <--> NoAccess
//!                         |                                  no_access() / read_only()
//!                         v
//!                take() / move: source is left empty
//! ```
//!
//! # Examples
//! Deriving a key from a password:
//!
//! ```rust
//! use keyguard::{pwhash, SecureKey, Strength};
//!
//! let salt = pwhash::generate_salt().unwrap();
//! let mut key = SecureKey::new_uninitialized(32).unwrap();
//! key.derive_from_password("Correct Horse Battery Staple", &salt, Strength::Low)
//!     .unwrap();
//!
//! // The key is now read-only, store `salt` to derive the same key again later.
//! key.no_access();
//! ```
//!
//! Storing key material generated elsewhere directly in guarded memory:
//!
//! ```rust
//! use keyguard::{random, KeyguardError, SecureKey};
//!
//! let key = SecureKey::generate_with(32, |buf| random::fill_random(buf)).unwrap();
//! assert_eq!(key.len(), 32);
//! # Ok::<(), KeyguardError>(())
//! ```

use crate::guarded::GuardedRegion;
use crate::{mem, pwhash, random, KeyguardError, Strength};
use std::fmt;

pub use crate::guarded::AccessState;

/// A fixed-length secret key held in guarded memory.
///
/// The bytes of the key are locked into physical memory, bracketed by guard pages, and zeroed
/// when the key is dropped. Access to the bytes is controlled by the key's [`AccessState`], which
/// is enforced by the hardware: reading a key in the [`AccessState::NoAccess`] state, or writing
/// to a key which is not [`AccessState::ReadWrite`], terminates the process.
///
/// `SecureKey` deliberately does not implement `Clone`: copying key material must be done
/// explicitly, using [`SecureKey::duplicate`].
///
/// Comparing two keys with `==` runs in constant time for keys of the same length.
#[derive(Default)]
pub struct SecureKey {
    // `None` for an empty key, which owns no memory at all.
    region: Option<GuardedRegion>,
}

impl SecureKey {
    /// Create a new key of `len` bytes.
    ///
    /// If `randomize` is true, the key is filled with random bytes suitable for cryptographic use,
    /// and is left [read-only](AccessState::ReadOnly). Otherwise, the key is zero-filled and left
    /// [read-write](AccessState::ReadWrite), ready to be filled by the caller (e.g: with
    /// [`SecureKey::derive_from_password`]).
    ///
    /// A key of length 0 owns no memory.
    ///
    /// Returns an error if the guarded memory for the key could not be allocated.
    pub fn create(len: usize, randomize: bool) -> Result<Self, KeyguardError> {
        let mut key = if len == 0 {
            Self::default()
        } else {
            Self {
                region: Some(GuardedRegion::allocate(len)?),
            }
        };

        if randomize {
            key.initialize()?;
        }

        Ok(key)
    }

    /// Create a new random key of `len` bytes, in the [read-only](AccessState::ReadOnly) state.
    ///
    /// Equivalent to `SecureKey::create(len, true)`.
    pub fn new(len: usize) -> Result<Self, KeyguardError> {
        Self::create(len, true)
    }

    /// Create a new zero-filled key of `len` bytes, in the [read-write](AccessState::ReadWrite)
    /// state.
    ///
    /// Equivalent to `SecureKey::create(len, false)`.
    pub fn new_uninitialized(len: usize) -> Result<Self, KeyguardError> {
        Self::create(len, false)
    }

    /// Create a [read-only](AccessState::ReadOnly) key holding a copy of `bytes`.
    ///
    /// This is intended for key material produced by some other function, such as the secret half
    /// of a keypair. The caller remains responsible for erasing `bytes` (see
    /// [`mem::clear`](crate::mem::clear)); where possible, prefer [`SecureKey::generate_with`],
    /// which avoids the secret ever leaving guarded memory.
    pub fn from_derived_bytes(bytes: &[u8]) -> Result<Self, KeyguardError> {
        Self::generate_with(bytes.len(), |buf: &mut [u8]| {
            buf.copy_from_slice(bytes);
            Ok::<(), KeyguardError>(())
        })
    }

    /// Create a key of `len` bytes, whose contents are written by `generate`.
    ///
    /// `generate` is passed the zero-filled, writable bytes of the new key. If it succeeds, the
    /// key is made [read-only](AccessState::ReadOnly) and returned. If it fails, the key is zeroed
    /// and released, and the error is passed on.
    pub fn generate_with<E, F>(len: usize, generate: F) -> Result<Self, E>
    where
        E: From<KeyguardError>,
        F: FnOnce(&mut [u8]) -> Result<(), E>,
    {
        let mut key = Self::new_uninitialized(len)?;

        match &mut key.region {
            Some(region) => {
                generate(unsafe {
                    // SAFETY: A freshly allocated region is read-write, and nothing else can
                    // change its protection while the slice is borrowed.
                    region.as_mut_slice()
                })?;
                region.set_read_only();
            }
            None => generate(&mut [])?,
        }

        Ok(key)
    }

    /// Fill this key with new random bytes.
    ///
    /// The key is made writable for the duration of the call, and is left
    /// [read-only](AccessState::ReadOnly) afterwards.
    pub fn initialize(&mut self) -> Result<(), KeyguardError> {
        if let Some(region) = &mut self.region {
            region.set_read_write();
            random::fill_random(unsafe {
                // SAFETY: The region was made read-write above.
                region.as_mut_slice()
            })?;
            region.set_read_only();
        }

        Ok(())
    }

    /// Fill this key with bytes derived from `password` and `salt`.
    ///
    /// The same `password`, `salt`, `strength`, and key length will always produce the same key.
    /// `salt` must be [`pwhash::SALT_LENGTH`] bytes; see the [`pwhash`] module for how to choose
    /// and store the salt and the strength.
    ///
    /// All arguments are validated before the key is modified: if this function returns an error
    /// other than [`DerivationFailed`](pwhash::DerivationError::DerivationFailed), the key is left
    /// exactly as it was, in the same access state. If the derivation itself fails, the key is
    /// zeroed and left [read-write](AccessState::ReadWrite), and should be discarded. On success,
    /// the key is left [read-only](AccessState::ReadOnly).
    ///
    /// This function blocks the calling thread until the derivation is complete, which can take
    /// several seconds at higher strengths.
    pub fn derive_from_password(
        &mut self,
        password: impl AsRef<[u8]>,
        salt: &[u8],
        strength: Strength,
    ) -> Result<(), KeyguardError> {
        let password = password.as_ref();
        pwhash::check_params(password, salt, self.len())?;

        let region = match &mut self.region {
            Some(region) => region,
            // `check_params` rejects an output length of 0.
            None => return Ok(()),
        };

        tracing::debug!(%strength, len = region.len(), "deriving key from password");
        region.set_read_write();

        let result = pwhash::derive_key(
            password,
            salt,
            strength,
            unsafe {
                // SAFETY: The region was made read-write above.
                region.as_mut_slice()
            },
        );

        match result {
            Ok(()) => {
                region.set_read_only();
                tracing::debug!(%strength, len = region.len(), "key derivation complete");
                Ok(())
            }
            Err(e) => {
                unsafe {
                    // SAFETY: The region is still read-write, and `as_mut_ptr` is valid for writes
                    // of `len` bytes.
                    mem::wipe(region.as_mut_ptr(), region.len());
                }
                Err(e)
            }
        }
    }

    /// Zero the contents of this key.
    ///
    /// The key is left [read-write](AccessState::ReadWrite) and keeps its length, so it can be
    /// refilled. Calling this more than once has no further effect.
    pub fn destroy(&mut self) {
        if let Some(region) = &mut self.region {
            region.set_read_write();
            unsafe {
                // SAFETY: The region was made read-write above, and `as_mut_ptr` is valid for
                // writes of `len` bytes.
                mem::wipe(region.as_mut_ptr(), region.len());
            }
        }
    }

    /// Make this key inaccessible: any read or write terminates the process.
    pub fn no_access(&mut self) {
        if let Some(region) = &mut self.region {
            region.set_no_access();
        }
    }

    /// Make this key read-only: any write terminates the process.
    pub fn read_only(&mut self) {
        if let Some(region) = &mut self.region {
            region.set_read_only();
        }
    }

    /// Make this key readable and writable.
    pub fn read_write(&mut self) {
        if let Some(region) = &mut self.region {
            region.set_read_write();
        }
    }

    /// The access state currently enforced on this key.
    ///
    /// An empty key always reports [`AccessState::ReadWrite`].
    pub fn access_state(&self) -> AccessState {
        self.region
            .as_ref()
            .map_or(AccessState::ReadWrite, GuardedRegion::access_state)
    }

    /// The length of this key, in bytes.
    pub fn len(&self) -> usize {
        self.region.as_ref().map_or(0, GuardedRegion::len)
    }

    /// Returns true if this key has length 0, e.g: after it was moved out of with
    /// [`SecureKey::take`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes of this key.
    ///
    /// The key must not be in the [`AccessState::NoAccess`] state while the returned slice is
    /// read, otherwise the process is terminated.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.region {
            Some(region) => unsafe {
                // SAFETY: The slice borrows `self`, so the protection of the region cannot change
                // while it is alive. Reading an inaccessible region traps rather than exhibiting
                // undefined behaviour.
                region.as_slice()
            },
            None => &[],
        }
    }

    /// A pointer to the first byte of this key, or a null pointer for an empty key.
    ///
    /// Useful to check whether two keys share storage; it should not be dereferenced.
    pub fn as_ptr(&self) -> *const u8 {
        self.region
            .as_ref()
            .map_or(std::ptr::null(), GuardedRegion::as_ptr)
    }

    /// Create an independent copy of this key, in new guarded memory.
    ///
    /// The copy has the same contents and the same access state as this key. This key must not be
    /// in the [`AccessState::NoAccess`] state.
    pub fn duplicate(&self) -> Result<Self, KeyguardError> {
        let source = match &self.region {
            Some(region) => region,
            None => return Ok(Self::default()),
        };

        let mut region = GuardedRegion::allocate(source.len())?;
        unsafe {
            // SAFETY: The new region is read-write, and the caller guarantees the source is
            // readable. Both are `source.len()` bytes long, and separate allocations cannot
            // overlap.
            region.as_mut_slice().copy_from_slice(source.as_slice());
        }
        region.set_access_state(source.access_state());

        Ok(Self {
            region: Some(region),
        })
    }

    /// Overwrite the contents of this key with those of `other`, in place.
    ///
    /// No memory is allocated: the bytes are written into this key's existing guarded memory, so
    /// [`SecureKey::as_ptr`] is unchanged. Afterwards, this key has the same access state as
    /// `other`. `other` must not be in the [`AccessState::NoAccess`] state.
    ///
    /// Returns [`KeyguardError::LengthMismatch`] if the keys are of different lengths, in which
    /// case this key is left untouched.
    pub fn copy_from(&mut self, other: &SecureKey) -> Result<(), KeyguardError> {
        if self.len() != other.len() {
            return Err(KeyguardError::LengthMismatch {
                expected: self.len(),
                found: other.len(),
            });
        }

        if let (Some(dest), Some(source)) = (&mut self.region, &other.region) {
            dest.set_read_write();
            unsafe {
                // SAFETY: The destination was made read-write above, and the caller guarantees
                // the source is readable. Both are the same length, and since `other` is borrowed
                // immutably while `self` is borrowed mutably, they are separate allocations.
                dest.as_mut_slice().copy_from_slice(source.as_slice());
            }
            dest.set_access_state(source.access_state());
        }

        Ok(())
    }

    /// Move the contents of this key into a new `SecureKey`, leaving this key empty.
    ///
    /// No key material is copied: the returned key takes over this key's guarded memory.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl PartialEq for SecureKey {
    fn eq(&self, other: &Self) -> bool {
        mem::ct_eq(self.as_bytes(), other.as_bytes())
    }
}

impl Eq for SecureKey {}

impl fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureKey")
            .field("len", &self.len())
            .field("state", &self.access_state())
            .finish_non_exhaustive()
    }
}

impl fmt::Pointer for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessState, SecureKey};
    use crate::pwhash::{self, DerivationError, SALT_LENGTH};
    use crate::{mem, random, KeyguardError, Strength};

    #[test]
    fn new_key_is_random_and_read_only() -> Result<(), KeyguardError> {
        for len in [1, 16, 32, 64, 1 << 12] {
            let key = SecureKey::new(len)?;
            assert_eq!(key.len(), len);
            assert_eq!(key.access_state(), AccessState::ReadOnly);
            if len >= 16 {
                assert!(!mem::is_zero(key.as_bytes())?);
            }
        }

        Ok(())
    }

    #[test]
    fn uninitialized_key_is_zeroed_and_writable() -> Result<(), KeyguardError> {
        let key = SecureKey::new_uninitialized(32)?;
        assert_eq!(key.len(), 32);
        assert_eq!(key.access_state(), AccessState::ReadWrite);
        assert!(mem::is_zero(key.as_bytes())?);

        Ok(())
    }

    #[test]
    fn empty_key() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(0)?;
        assert!(key.is_empty());
        assert!(key.as_ptr().is_null());
        assert_eq!(key.as_bytes(), &[] as &[u8]);

        key.no_access();
        assert_eq!(key.access_state(), AccessState::ReadWrite);
        key.destroy();
        key.initialize()?;
        assert!(key.is_empty());

        assert_eq!(key, SecureKey::default());

        Ok(())
    }

    #[test]
    fn initialize_refills() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(32)?;
        let before = key.duplicate()?;

        key.no_access();
        key.initialize()?;
        assert_eq!(key.access_state(), AccessState::ReadOnly);
        assert_ne!(key, before);

        Ok(())
    }

    #[test]
    fn destroy_is_idempotent() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(32)?;
        key.no_access();

        key.destroy();
        assert_eq!(key.len(), 32);
        assert_eq!(key.access_state(), AccessState::ReadWrite);
        assert!(mem::is_zero(key.as_bytes())?);

        key.destroy();
        assert_eq!(key.len(), 32);
        assert!(mem::is_zero(key.as_bytes())?);

        Ok(())
    }

    #[test]
    fn access_transitions() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(32)?;

        key.no_access();
        assert_eq!(key.access_state(), AccessState::NoAccess);
        key.read_only();
        assert_eq!(key.access_state(), AccessState::ReadOnly);
        key.read_write();
        assert_eq!(key.access_state(), AccessState::ReadWrite);
        key.read_only();
        key.no_access();
        key.read_write();
        assert_eq!(key.access_state(), AccessState::ReadWrite);

        Ok(())
    }

    #[test]
    fn duplicate_copies_contents_and_state() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(32)?;
        let copy = key.duplicate()?;

        assert_eq!(key, copy);
        assert_ne!(key.as_ptr(), copy.as_ptr());
        assert_eq!(copy.access_state(), AccessState::ReadOnly);

        key.read_write();
        let copy = key.duplicate()?;
        assert_eq!(copy.access_state(), AccessState::ReadWrite);
        assert_eq!(key, copy);

        Ok(())
    }

    #[test]
    fn copy_from_reuses_storage() -> Result<(), KeyguardError> {
        let source = SecureKey::new(32)?;
        let mut dest = SecureKey::new(32)?;
        let ptr = dest.as_ptr();
        dest.no_access();

        dest.copy_from(&source)?;
        assert_eq!(dest.as_ptr(), ptr);
        assert_eq!(dest, source);
        assert_eq!(dest.access_state(), AccessState::ReadOnly);

        let mut writable = SecureKey::new_uninitialized(32)?;
        writable.copy_from(&source)?;
        writable.read_write();
        let mut dest = SecureKey::new(32)?;
        dest.copy_from(&writable)?;
        assert_eq!(dest.access_state(), AccessState::ReadWrite);
        assert_eq!(dest, source);

        let mut empty = SecureKey::default();
        empty.copy_from(&SecureKey::new(0)?)?;
        assert!(empty.is_empty());

        Ok(())
    }

    #[test]
    fn copy_from_rejects_length_mismatch() -> Result<(), KeyguardError> {
        let source = SecureKey::new(16)?;
        let mut dest = SecureKey::new(32)?;
        let before = dest.duplicate()?;

        assert_eq!(
            dest.copy_from(&source),
            Err(KeyguardError::LengthMismatch {
                expected: 32,
                found: 16,
            })
        );
        assert_eq!(dest, before);
        assert_eq!(dest.access_state(), AccessState::ReadOnly);

        let mut empty = SecureKey::default();
        assert!(empty.copy_from(&source).is_err());
        assert!(empty.is_empty());

        Ok(())
    }

    #[test]
    fn take_leaves_source_empty() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(32)?;
        let ptr = key.as_ptr();
        let copy = key.duplicate()?;

        let moved = key.take();
        assert!(key.is_empty());
        assert!(key.as_ptr().is_null());
        assert_eq!(moved.len(), 32);
        assert_eq!(moved.as_ptr(), ptr);
        assert_eq!(moved, copy);

        let mut moved = moved;
        let moved_again = std::mem::take(&mut moved);
        assert!(moved.is_empty());
        assert_eq!(moved_again.as_ptr(), ptr);

        Ok(())
    }

    #[test]
    fn equality() -> Result<(), KeyguardError> {
        let a = SecureKey::from_derived_bytes(&[1, 2, 3, 4])?;
        let b = SecureKey::from_derived_bytes(&[1, 2, 3, 4])?;
        let c = SecureKey::from_derived_bytes(&[1, 2, 3, 5])?;
        let d = SecureKey::from_derived_bytes(&[1, 2, 3])?;

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(SecureKey::new(0)?, SecureKey::default());

        Ok(())
    }

    #[test]
    fn from_derived_bytes() -> Result<(), KeyguardError> {
        let mut material = [0u8; 64];
        random::fill_random(&mut material)?;

        let key = SecureKey::from_derived_bytes(&material)?;
        assert_eq!(key.access_state(), AccessState::ReadOnly);
        assert_eq!(key.as_bytes(), &material[..]);

        Ok(())
    }

    #[test]
    fn generate_with() -> Result<(), KeyguardError> {
        let key = SecureKey::generate_with(8, |buf| {
            buf.copy_from_slice(b"abcdefgh");
            Ok::<(), KeyguardError>(())
        })?;
        assert_eq!(key.access_state(), AccessState::ReadOnly);
        assert_eq!(key.as_bytes(), b"abcdefgh");

        let failed = SecureKey::generate_with(8, |_| {
            Err(KeyguardError::Derivation(DerivationError::DerivationFailed))
        });
        assert_eq!(
            failed.map(|_| ()),
            Err(KeyguardError::Derivation(DerivationError::DerivationFailed))
        );

        Ok(())
    }

    #[test]
    fn debug_hides_contents() -> Result<(), KeyguardError> {
        let key = SecureKey::from_derived_bytes(&[0xab; 4])?;
        let debug = format!("{:?}", key);
        assert!(debug.contains("len: 4"));
        assert!(debug.contains("ReadOnly"));
        assert!(!debug.contains("171"));

        assert_eq!(format!("{:p}", key), format!("{:p}", key.as_ptr()));

        Ok(())
    }

    #[test]
    fn derivation_is_deterministic() -> Result<(), KeyguardError> {
        let salt = pwhash::generate_salt()?;
        let mut a = SecureKey::new_uninitialized(32)?;
        let mut b = SecureKey::new(32)?;

        a.derive_from_password("hunter2", &salt, Strength::Low)?;
        b.derive_from_password(b"hunter2", &salt, Strength::Low)?;
        assert_eq!(a, b);
        assert_eq!(a.access_state(), AccessState::ReadOnly);
        assert_eq!(a.len(), 32);

        b.no_access();
        b.derive_from_password("hunter2", &salt, Strength::Low)?;
        assert_eq!(a, b);

        Ok(())
    }

    #[test]
    fn derivation_depends_on_every_input() -> Result<(), KeyguardError> {
        let salt_a = pwhash::generate_salt()?;
        let salt_b = pwhash::generate_salt()?;

        let mut base = SecureKey::new_uninitialized(32)?;
        base.derive_from_password("pw1", &salt_a, Strength::Low)?;

        let mut other_password = SecureKey::new_uninitialized(32)?;
        other_password.derive_from_password("pw2", &salt_a, Strength::Low)?;
        assert_ne!(base, other_password);

        let mut other_salt = SecureKey::new_uninitialized(32)?;
        other_salt.derive_from_password("pw1", &salt_b, Strength::Low)?;
        assert_ne!(base, other_salt);

        let mut other_strength = SecureKey::new_uninitialized(32)?;
        other_strength.derive_from_password("pw1", &salt_a, Strength::Medium)?;
        assert_ne!(base, other_strength);

        Ok(())
    }

    #[test]
    fn wrong_salt_leaves_key_untouched() -> Result<(), KeyguardError> {
        let mut key = SecureKey::new(32)?;
        let before = key.duplicate()?;

        for len in [0, SALT_LENGTH - 1, SALT_LENGTH + 1, 64] {
            let salt = vec![0u8; len];
            assert_eq!(
                key.derive_from_password("pw", &salt, Strength::Low),
                Err(KeyguardError::Derivation(DerivationError::InvalidSalt {
                    expected: SALT_LENGTH,
                    found: len,
                }))
            );
            assert_eq!(key, before);
            assert_eq!(key.access_state(), AccessState::ReadOnly);
        }

        key.no_access();
        assert!(key
            .derive_from_password("pw", &[0u8; 3], Strength::Low)
            .is_err());
        assert_eq!(key.access_state(), AccessState::NoAccess);

        Ok(())
    }

    #[test]
    fn derivation_rejects_short_output() -> Result<(), KeyguardError> {
        let salt = pwhash::generate_salt()?;
        let mut key = SecureKey::new_uninitialized(pwhash::OUTPUT_LENGTH_MIN - 1)?;

        assert_eq!(
            key.derive_from_password("pw", &salt, Strength::Low),
            Err(KeyguardError::Derivation(
                DerivationError::OutputLengthInvalid
            ))
        );
        assert!(mem::is_zero(key.as_bytes())?);

        let mut empty = SecureKey::default();
        assert!(empty
            .derive_from_password("pw", &salt, Strength::Low)
            .is_err());

        Ok(())
    }

    #[test]
    #[ignore = "requires 1 GiB of memory"]
    fn derivation_at_high_strength() -> Result<(), KeyguardError> {
        let salt = pwhash::generate_salt()?;
        let mut a = SecureKey::new_uninitialized(32)?;
        let mut b = SecureKey::new_uninitialized(32)?;

        a.derive_from_password("pw", &salt, Strength::High)?;
        b.derive_from_password("pw", &salt, Strength::default())?;
        assert_eq!(a, b);

        Ok(())
    }

    #[test]
    fn keys_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SecureKey>();
    }
}
