//! Typical key sizes, in bytes, for the Sodium constructions a [`SecureKey`](crate::SecureKey)
//! is most often used with.

use libsodium_sys as sodium;

/// Key size for `crypto_secretbox` (authenticated symmetric encryption).
pub const KEYSIZE_SECRETBOX: usize = sodium::crypto_secretbox_KEYBYTES as usize;

/// Key size for `crypto_auth` (message authentication).
pub const KEYSIZE_AUTH: usize = sodium::crypto_auth_KEYBYTES as usize;

/// Salt size for `crypto_pwhash`, see [`crate::pwhash::SALT_LENGTH`].
pub const KEYSIZE_SALT: usize = sodium::crypto_pwhash_SALTBYTES as usize;

/// Key size for `crypto_aead_chacha20poly1305`.
pub const KEYSIZE_AEAD: usize = sodium::crypto_aead_chacha20poly1305_KEYBYTES as usize;

/// Default key size for `crypto_generichash` (keyed hashing).
pub const KEYSIZE_HASHKEY: usize = sodium::crypto_generichash_KEYBYTES as usize;

/// Minimum key size for `crypto_generichash`.
pub const KEYSIZE_HASHKEY_MIN: usize = sodium::crypto_generichash_KEYBYTES_MIN as usize;

/// Maximum key size for `crypto_generichash`.
pub const KEYSIZE_HASHKEY_MAX: usize = sodium::crypto_generichash_KEYBYTES_MAX as usize;

/// Public key size for `crypto_box`.
pub const KEYSIZE_PUBKEY: usize = sodium::crypto_box_PUBLICKEYBYTES as usize;

/// Secret key size for `crypto_box`.
pub const KEYSIZE_PRIVKEY: usize = sodium::crypto_box_SECRETKEYBYTES as usize;

/// Seed size for deterministic `crypto_box` keypair generation.
pub const KEYSIZE_SEEDBYTES: usize = sodium::crypto_box_SEEDBYTES as usize;
