//! Property tests for the token bucket

use proptest::prelude::*;
use vsm_resilience::{BucketScope, RateLimiter, RateLimiterConfig};

proptest! {
    /// However consumption is interleaved, the balance stays within
    /// `[0, capacity]` and rejected requests deduct nothing.
    #[test]
    fn balance_stays_bounded(
        capacity in 1.0f64..500.0,
        requests in prop::collection::vec(0.1f64..50.0, 1..100),
    ) {
        let limiter = RateLimiter::new(RateLimiterConfig {
            bucket_size: capacity,
            refill_rate: 0.0,
            refill_interval: std::time::Duration::from_millis(100),
        });

        let mut expected = capacity;
        for n in requests {
            match limiter.consume(&BucketScope::Global, n) {
                Ok(remaining) => {
                    expected -= n;
                    prop_assert!((remaining - expected).abs() < 1e-6);
                }
                Err(_) => {
                    // No deduction on rejection
                    prop_assert!(expected < n);
                }
            }
            let balance = limiter.balance(&BucketScope::Global).unwrap();
            prop_assert!(balance >= -1e-9);
            prop_assert!(balance <= capacity + 1e-9);
        }
    }
}
