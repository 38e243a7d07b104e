//! Property tests for the box constructions.

use proptest::prelude::*;

use crate::nacl::{box_open, box_seal, sealed_box_open, sealed_box_seal, KeyPair};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_box_round_trip(msg in proptest::collection::vec(any::<u8>(), 0..512)) {
        let ws = KeyPair::generate().unwrap();
        let enclave = KeyPair::generate().unwrap();

        let boxed = box_seal(&msg, &enclave.public, ws.secret_bytes()).unwrap();
        let opened = box_open(&boxed, &ws.public, enclave.secret_bytes()).unwrap();
        prop_assert_eq!(opened, msg);
    }

    #[test]
    fn prop_any_flipped_byte_fails(
        msg in proptest::collection::vec(any::<u8>(), 1..128),
        idx in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let ws = KeyPair::generate().unwrap();
        let enclave = KeyPair::generate().unwrap();

        let mut boxed = box_seal(&msg, &enclave.public, ws.secret_bytes()).unwrap();
        let i = idx.index(boxed.len());
        boxed[i] ^= 1 << bit;
        prop_assert!(box_open(&boxed, &ws.public, enclave.secret_bytes()).is_err());
    }

    #[test]
    fn prop_sealed_box_round_trip(msg in proptest::collection::vec(any::<u8>(), 0..256)) {
        let recipient = KeyPair::generate().unwrap();
        let sealed = sealed_box_seal(&msg, &recipient.public).unwrap();
        prop_assert_eq!(sealed_box_open(&sealed, &recipient).unwrap(), msg);
    }
}
