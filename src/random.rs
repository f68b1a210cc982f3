//! Random data suitable for cryptographic use.
//!
//! This module is a wrapper around the [`randombytes`
//! API](https://doc.libsodium.org/generating_random_data) from Sodium. Random data is sourced from
//! the platform's secure RNG API (e.g: `getrandom`, `/dev/urandom`). It is used to fill new keys,
//! to generate salts, and to generate the canary which guards every
//! [`GuardedRegion`](crate::guarded::GuardedRegion).
//!
//! # Examples
//! Using the [rand](https://rust-random.github.io/book)-compatible API:
//!
//! ```rust
//! use keyguard::random::SodiumRng;
//! use rand_core::RngCore;
//!
//! let mut rng = SodiumRng;
//! println!("My random number is... {}", rng.next_u64());
//! ```
//!
//! Using the more basic API:
//!
//! ```rust
//! use keyguard::random;
//!
//! let mut my_random_data = [0u8; 32];
//! random::fill_random(&mut my_random_data).unwrap();
//! ```

use crate::{require_init, KeyguardError};
use libsodium_sys as sodium;
use rand_core::{impls, CryptoRng, Error as RandError, RngCore};

/// [rand](https://rust-random.github.io/book)-compatible CSPRNG API.
///
/// This struct implements the `RngCore` trait, allowing it to be used as a source of randomness for
/// `rand`, or anywhere else a [`CryptoRng`] is expected.
#[derive(Clone, Copy, Debug)]
pub struct SodiumRng;

impl RngCore for SodiumRng {
    fn next_u32(&mut self) -> u32 {
        // `randombytes_random` cannot fail once Sodium is initialised, and `RngCore::next_u32`
        // has no way to report an initialisation failure.
        random_u32().expect("failed to initialise libsodium")
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("failed to initialise libsodium")
    }

    #[cfg(feature = "std")]
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), RandError> {
        fill_random(dest).map_err(RandError::new)
    }

    #[cfg(not(feature = "std"))]
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), RandError> {
        fill_random(dest).map_err(|_| {
            core::num::NonZeroU32::new(RandError::CUSTOM_START)
                .expect("CUSTOM_START is non-zero")
                .into()
        })
    }
}

impl CryptoRng for SodiumRng {}

/// Returns a random 32-bit integer.
fn random_u32() -> Result<u32, KeyguardError> {
    require_init()?;

    unsafe {
        // SAFETY: This function is safe as long as Sodium has been initialised, which we ensure
        // with the call to `require_init` above.
        Ok(sodium::randombytes_random())
    }
}

/// Fill `buf` with random data suitable for cryptographic use.
///
/// Returns an error if Sodium could not be correctly initialised.
pub fn fill_random(buf: &mut [u8]) -> Result<(), KeyguardError> {
    require_init()?;

    unsafe {
        // SAFETY: The first argument to this function should be a pointer to which random data will
        // be written, and the second argument should be the number of bytes to write, starting at
        // the pointer. We use `buf.len()` to specify the number of bytes to write, so `buf` is
        // clearly valid for writes of the required length.
        sodium::randombytes_buf(buf.as_mut_ptr() as *mut libc::c_void, buf.len());
    }

    Ok(())
}
