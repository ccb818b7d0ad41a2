//! Property tests for the hybrid logical clock

use proptest::prelude::*;
use vsm_core::hlc::{HlcTimestamp, HybridLogicalClock};

proptest! {
    /// Local ticks interleaved with arbitrary remote observations never
    /// move the clock backwards.
    #[test]
    fn observing_remotes_preserves_monotonicity(
        remotes in prop::collection::vec((0u64..u64::MAX / 2, 0u32..1000), 1..50),
    ) {
        let clock = HybridLogicalClock::new("prop-node");
        let mut prev = clock.tick().unwrap();

        for (physical_ms, logical) in remotes {
            let remote = HlcTimestamp {
                physical_ms,
                logical,
                node_id: "remote".to_string(),
            };
            let merged = clock.observe(&remote).unwrap();
            prop_assert!(merged > prev, "{} should exceed {}", merged, prev);

            let next = clock.tick().unwrap();
            prop_assert!(next > merged);
            prev = next;
        }
    }

    /// Ordering is total and consistent with the lexicographic triple.
    #[test]
    fn ordering_is_lexicographic(
        a in (0u64..1000, 0u32..1000, "[a-z]{1,8}"),
        b in (0u64..1000, 0u32..1000, "[a-z]{1,8}"),
    ) {
        let ta = HlcTimestamp { physical_ms: a.0, logical: a.1, node_id: a.2.clone() };
        let tb = HlcTimestamp { physical_ms: b.0, logical: b.1, node_id: b.2.clone() };

        let expected = (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2));
        prop_assert_eq!(ta.cmp(&tb), expected);
    }
}
