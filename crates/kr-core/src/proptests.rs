//! Property tests for the wire messages and the host-key cache.

use std::time::Duration;

use proptest::prelude::*;

use crate::known_hosts::KnownHosts;
use crate::persist::MemoryPersister;
use crate::protocol::{
    HostKeyPolicy, Request, RequestBody, Response, ResponseBody, SignRequest, SignResponse,
};

fn policy() -> impl Strategy<Value = HostKeyPolicy> {
    prop_oneof![Just(HostKeyPolicy::Pinned), Just(HostKeyPolicy::TrustedOnce)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sign_request_json_round_trip(
        data in proptest::collection::vec(any::<u8>(), 0..256),
        fingerprint in proptest::collection::vec(any::<u8>(), 32),
        command in proptest::option::of("[a-z ]{1,24}"),
    ) {
        let request = Request::new(RequestBody::Sign(SignRequest {
            data,
            public_key_fingerprint: fingerprint,
            command,
            host_auth: None,
        }))
        .unwrap();
        let json = serde_json::to_vec(&request).unwrap();
        let back: Request = serde_json::from_slice(&json).unwrap();
        prop_assert_eq!(back, request);
    }

    #[test]
    fn prop_sign_response_json_round_trip(
        id in "[A-Za-z0-9]{1,22}",
        signature in proptest::option::of(proptest::collection::vec(any::<u8>(), 1..300)),
        error in proptest::option::of("[a-z ]{1,32}"),
        approved_until in proptest::option::of(1i64..4_000_000_000),
    ) {
        let mut response = Response::new(
            id,
            Some(ResponseBody::Sign(SignResponse { signature, error, host_key_policy: None })),
        );
        response.approved_until = approved_until;
        let json = serde_json::to_vec(&response).unwrap();
        let back: Response = serde_json::from_slice(&json).unwrap();
        prop_assert_eq!(back, response);
    }

    #[test]
    fn prop_known_hosts_survive_save_and_load(
        entries in proptest::collection::vec(
            (
                "[a-z0-9]{1,12}(\\.[a-z]{2,6}){0,2}",
                1u16..,
                proptest::collection::vec(any::<u8>(), 1..64),
                policy(),
            ),
            0..12,
        ),
        ttl_secs in 1u64..1_000_000,
        now in 1i64..4_000_000_000,
    ) {
        let mut known = KnownHosts::default();
        for (host, port, key, policy) in &entries {
            known.insert(host, *port, key, *policy, Duration::from_secs(ttl_secs), now);
        }
        let persister = MemoryPersister::new();
        known.save(&persister).unwrap();
        let loaded = KnownHosts::load(&persister).unwrap();
        prop_assert_eq!(loaded.entries(), known.entries());
    }
}
