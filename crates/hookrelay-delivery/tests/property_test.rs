//! Property-based checks of the backoff calculator and signing.

#![allow(clippy::unwrap_used)]

use hookrelay_delivery::{next_delay, sign_payload, verify_signature};
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

proptest! {
    #[test]
    fn doubling_schedule_is_capped(k in 1u32..200) {
        let mut rng = StdRng::seed_from_u64(0);
        let expected = 2f64.powi(i32::try_from(k - 1).unwrap()).min(100.0);
        prop_assert_eq!(next_delay(1.0, 2.0, 0.0, 100.0, k, &mut rng), expected);
    }

    #[test]
    fn delay_stays_within_bounds(
        base in 0.0f64..50.0,
        factor in 1.0f64..4.0,
        jitter in 0.0f64..10.0,
        ceiling in 0.0f64..600.0,
        k in 1u32..64,
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = next_delay(base, factor, jitter, ceiling, k, &mut rng);
        let floor = (base * factor.powi(i32::try_from(k - 1).unwrap())).min(ceiling);

        prop_assert!(delay >= floor);
        prop_assert!(delay <= ceiling + jitter);
    }

    #[test]
    fn delay_is_monotonic_without_jitter(
        base in 0.01f64..10.0,
        factor in 1.0f64..3.0,
        k in 1u32..40,
    ) {
        let mut rng = StdRng::seed_from_u64(0);
        let now = next_delay(base, factor, 0.0, 300.0, k, &mut rng);
        let next = next_delay(base, factor, 0.0, 300.0, k + 1, &mut rng);
        prop_assert!(next >= now);
    }

    #[test]
    fn signature_detects_any_single_byte_change(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let signature = sign_payload(b"secret", &payload).unwrap();
        prop_assert!(verify_signature(b"secret", &payload, &signature));

        let mut tampered = payload.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        prop_assert_ne!(sign_payload(b"secret", &tampered).unwrap(), signature);
    }
}
