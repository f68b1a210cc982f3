//! Password-based key derivation.
//!
//! This module corresponds to the [`crypto_pwhash`
//! API](https://doc.libsodium.org/password_hashing) from Sodium, and is used by
//! [`SecureKey::derive_from_password`](crate::SecureKey::derive_from_password) to fill a key
//! deterministically from a password and a salt.
//!
//! Password-based key derivation functions are intentionally computationally-intensive and
//! memory-hard, so that an attacker trying to brute force the password from a derived key has to
//! spend significantly more time and memory per guess than with a fast hash. The algorithm used is
//! Sodium's default, [Argon2id](https://en.wikipedia.org/wiki/Argon2).
//!
//! # Choosing a Strength
//! Rather than exposing the raw operations and memory limits, keys are derived using one of three
//! [`Strength`] profiles, which correspond to Sodium's baseline parameter sets:
//! * [`Strength::Low`]: For interactive, online operations (requires 64 MiB memory)
//! * [`Strength::Medium`]: More conservative values for online operations (requires 256 MiB
//!   memory)
//! * [`Strength::High`]: For offline operations, such as unlocking an encrypted backup (requires
//!   1 GiB memory). This is the default.
//!
//! Key derivation blocks the calling thread for the whole computation, which takes on the order
//! of seconds for the higher profiles, and cannot be cancelled once started. If this is a problem
//! for your application, run it on a background thread. The same strength must be used to derive
//! the same key later on, so you may wish to store it alongside the salt.
//!
//! # Security Considerations
//! The salt does not need to be kept secret, but should be generated randomly (see
//! [`generate_salt`]) each time a new key is first derived, and must be stored to be able to
//! derive the same key again.
//!
//! Passwords should ideally be erased from memory as soon as the key has been derived. The
//! [`mem::clear`](crate::mem::clear) function can be used for this.

use crate::{random, require_init, KeyguardError};
use libsodium_sys as sodium;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type returned if something went wrong during key derivation.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum DerivationError {
    /// The salt provided was not [`SALT_LENGTH`] bytes long.
    #[error("incorrect salt length: expected {expected}, found {found}")]
    InvalidSalt {
        /// The required salt length.
        expected: usize,
        /// The length of the salt which was provided.
        found: usize,
    },

    /// The strength profile was not recognised.
    ///
    /// Returned when parsing a [`Strength`] from a string or integer which does not name one of the
    /// known profiles.
    #[error("unrecognised strength profile")]
    InvalidStrength,

    /// The password provided was too short or too long for use with this algorithm.
    ///
    /// Passwords must be at least [`PASSWORD_LENGTH_MIN`] and at most
    /// [`PASSWORD_LENGTH_MAX`](struct@PASSWORD_LENGTH_MAX) bytes.
    #[error("password length outside acceptable range")]
    PasswordLengthInvalid,

    /// The requested output is too short or too long for use with this algorithm.
    ///
    /// The derived key size must be at least [`OUTPUT_LENGTH_MIN`] bytes and at most
    /// [`OUTPUT_LENGTH_MAX`](struct@OUTPUT_LENGTH_MAX) bytes.
    #[error("requested output length is too short or too long")]
    OutputLengthInvalid,

    /// The key derivation failed.
    ///
    /// This most likely indicates there is insufficient memory available for the strength profile
    /// you specified. You may wish to retry with a lower strength, but note that this will derive a
    /// different key.
    #[error("key derivation failed")]
    DerivationFailed,
}

/// The length of a salt, in bytes.
pub const SALT_LENGTH: usize = sodium::crypto_pwhash_SALTBYTES as usize;

/// The minimum length for a password, in bytes.
pub const PASSWORD_LENGTH_MIN: usize = sodium::crypto_pwhash_PASSWD_MIN as usize;

/// The minimum output size for key derivation, in bytes.
pub const OUTPUT_LENGTH_MIN: usize = sodium::crypto_pwhash_BYTES_MIN as usize;

lazy_static::lazy_static! {
    /// The maximum length for a password, in bytes.
    pub static ref PASSWORD_LENGTH_MAX: usize = unsafe {
        // SAFETY: This function just returns a constant value, and should always be safe to call.
        sodium::crypto_pwhash_passwd_max()
    };

    /// The maximum output size for key derivation, in bytes.
    pub static ref OUTPUT_LENGTH_MAX: usize = unsafe {
        // SAFETY: This function just returns a constant value, and should always be safe to call.
        sodium::crypto_pwhash_bytes_max()
    };
}

/// A salt for key derivation, used to introduce non-determinism into the derivation.
pub type Salt = [u8; SALT_LENGTH];

/// How much effort goes into deriving a key from a password.
///
/// See [Choosing a Strength](self#choosing-a-strength).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "use-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Strength {
    /// Sodium's `INTERACTIVE` limits.
    Low,

    /// Sodium's `MODERATE` limits.
    Medium,

    /// Sodium's `SENSITIVE` limits.
    #[default]
    High,
}

impl Strength {
    /// The operations limit (CPU cost) for this profile.
    pub const fn ops_limit(self) -> usize {
        match self {
            Strength::Low => sodium::crypto_pwhash_OPSLIMIT_INTERACTIVE as usize,
            Strength::Medium => sodium::crypto_pwhash_OPSLIMIT_MODERATE as usize,
            Strength::High => sodium::crypto_pwhash_OPSLIMIT_SENSITIVE as usize,
        }
    }

    /// The memory limit (memory cost, in bytes) for this profile.
    pub const fn mem_limit(self) -> usize {
        match self {
            Strength::Low => sodium::crypto_pwhash_MEMLIMIT_INTERACTIVE as usize,
            Strength::Medium => sodium::crypto_pwhash_MEMLIMIT_MODERATE as usize,
            Strength::High => sodium::crypto_pwhash_MEMLIMIT_SENSITIVE as usize,
        }
    }

    /// The lowercase name of this profile.
    pub const fn as_str(self) -> &'static str {
        match self {
            Strength::Low => "low",
            Strength::Medium => "medium",
            Strength::High => "high",
        }
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strength {
    type Err = KeyguardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("low") {
            Ok(Strength::Low)
        } else if s.eq_ignore_ascii_case("medium") {
            Ok(Strength::Medium)
        } else if s.eq_ignore_ascii_case("high") {
            Ok(Strength::High)
        } else {
            Err(DerivationError::InvalidStrength.into())
        }
    }
}

impl TryFrom<u8> for Strength {
    type Error = KeyguardError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Strength::Low),
            1 => Ok(Strength::Medium),
            2 => Ok(Strength::High),
            _ => Err(DerivationError::InvalidStrength.into()),
        }
    }
}

/// Generate a random salt for use with [`derive_key`].
pub fn generate_salt() -> Result<Salt, KeyguardError> {
    let mut salt = [0u8; SALT_LENGTH];
    random::fill_random(&mut salt)?;
    Ok(salt)
}

/// Check that `password`, `salt` and an output of `output_len` bytes are acceptable for
/// [`derive_key`], without doing any work.
pub fn check_params(password: &[u8], salt: &[u8], output_len: usize) -> Result<(), KeyguardError> {
    require_init()?;

    if salt.len() != SALT_LENGTH {
        return Err(DerivationError::InvalidSalt {
            expected: SALT_LENGTH,
            found: salt.len(),
        }
        .into());
    } else if !(PASSWORD_LENGTH_MIN..=*PASSWORD_LENGTH_MAX).contains(&password.len()) {
        return Err(DerivationError::PasswordLengthInvalid.into());
    } else if !(OUTPUT_LENGTH_MIN..=*OUTPUT_LENGTH_MAX).contains(&output_len) {
        return Err(DerivationError::OutputLengthInvalid.into());
    }

    Ok(())
}

/// Derive a key from a low-entropy input (i.e: a password).
///
/// `password` is the password from which the key is to be derived. `salt` must be [`SALT_LENGTH`]
/// bytes, and should have been generated with [`generate_salt`] when the key was first derived.
/// `strength` selects the cost of the derivation, see [Choosing a
/// Strength](self#choosing-a-strength).
///
/// The final argument is the buffer to which the derived key will be written. This can be of any
/// length between [`OUTPUT_LENGTH_MIN`] and [`OUTPUT_LENGTH_MAX`](struct@OUTPUT_LENGTH_MAX)
/// bytes.
///
/// All arguments are validated before `key` is written to, so if this function returns
/// [`DerivationError::InvalidSalt`], [`DerivationError::PasswordLengthInvalid`], or
/// [`DerivationError::OutputLengthInvalid`], `key` is untouched. If it returns
/// [`DerivationError::DerivationFailed`], the contents of `key` are unspecified.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    strength: Strength,
    key: &mut [u8],
) -> Result<(), KeyguardError> {
    check_params(password, salt, key.len())?;

    let pwhash_result = unsafe {
        // SAFETY: The first two arguments to this function specify the destination to which the
        // derived key should be written, and the desired length of the key. We verify above that
        // the desired length is within the acceptable range of key lengths. We use `key.len()` to
        // specify the number of bytes to write to `key`, so `key` is definitely valid for writes of
        // this length. The next two arguments specify the password from which the key should be
        // derived and its length. We use `password.len()` to specify the length of the password, so
        // `password` is definitely valid for reads of this length. We cast the `*const u8` pointer
        // to a `*const c_char` pointer to pass to the C function, which is safe because `u8` and
        // `c_char` have the same representation. The next argument should be a pointer to the salt
        // to use in the hash calculation; we verify above that `salt` is exactly
        // `crypto_pwhash_SALTBYTES` long. The next two arguments specify the operations and memory
        // limits, which are just integers taken from Sodium's own baseline constants. The final
        // argument is the algorithm identifier, Sodium's default.
        sodium::crypto_pwhash(
            key.as_mut_ptr(),
            key.len() as libc::c_ulonglong,
            password.as_ptr() as *const libc::c_char,
            password.len() as libc::c_ulonglong,
            salt.as_ptr(),
            strength.ops_limit() as libc::c_ulonglong,
            strength.mem_limit(),
            sodium::crypto_pwhash_ALG_DEFAULT as libc::c_int,
        )
    };

    if pwhash_result == 0 {
        Ok(())
    } else {
        tracing::debug!(%strength, "crypto_pwhash() failed");
        Err(DerivationError::DerivationFailed.into())
    }
}
