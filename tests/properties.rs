//! Property-based tests over key lengths and contents.

use keyguard::{mem, AccessState, SecureKey};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn new_key_has_requested_length(len in 0usize..8192) {
        let key = SecureKey::new(len).unwrap();
        prop_assert_eq!(key.len(), len);
        prop_assert_eq!(key.as_bytes().len(), len);
    }

    #[test]
    fn uninitialized_key_is_zeroed(len in 1usize..8192) {
        let key = SecureKey::new_uninitialized(len).unwrap();
        prop_assert!(mem::is_zero(key.as_bytes()).unwrap());
        prop_assert_eq!(key.access_state(), AccessState::ReadWrite);
    }

    #[test]
    fn stored_bytes_are_preserved(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let mut key = SecureKey::from_derived_bytes(&bytes).unwrap();
        prop_assert_eq!(key.as_bytes(), &bytes[..]);

        key.no_access();
        key.read_only();
        prop_assert_eq!(key.as_bytes(), &bytes[..]);

        let copy = key.duplicate().unwrap();
        prop_assert!(copy == key);
    }

    #[test]
    fn equality_matches_contents(
        a in prop::collection::vec(any::<u8>(), 0..64),
        b in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let key_a = SecureKey::from_derived_bytes(&a).unwrap();
        let key_b = SecureKey::from_derived_bytes(&b).unwrap();
        prop_assert_eq!(key_a == key_b, a == b);
    }

    #[test]
    fn destroy_zeroes_any_key(len in 0usize..4096) {
        let mut key = SecureKey::new(len).unwrap();
        key.no_access();
        key.destroy();
        prop_assert_eq!(key.len(), len);
        prop_assert!(mem::is_zero(key.as_bytes()).unwrap());
    }
}
