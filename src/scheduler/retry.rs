//! Deterministic exponential backoff with jitter, seeded from the item's
//! RNG sub-stream so two replays of a flaky node retry at the same delays
//! (§9 "RNG injection").

use std::time::Duration;

use rand::Rng;

use crate::node::NodePolicy;
use crate::rng::{step_rng, RngSeed};
use crate::types::Attempt;

pub(super) fn jittered_delay(policy: &NodePolicy, attempt: Attempt, item_seed: RngSeed) -> Duration {
    let base = policy.base_delay_for_attempt(attempt);
    if policy.jitter_fraction <= 0.0 {
        return base;
    }
    let mut rng = step_rng(item_seed.wrapping_add(u64::from(attempt.0)).wrapping_mul(31));
    let jitter: f64 = rng.random_range(-policy.jitter_fraction..=policy.jitter_fraction);
    let factor = (1.0 + jitter).max(0.0);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_yield_same_delay() {
        let policy = NodePolicy::default().with_backoff(Duration::from_millis(50), 2.0);
        let a = jittered_delay(&policy, Attempt(2), 7);
        let b = jittered_delay(&policy, Attempt(2), 7);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_jitter_returns_base_delay() {
        let policy = NodePolicy::default()
            .with_backoff(Duration::from_millis(100), 2.0)
            .with_jitter_fraction(0.0);
        let delay = jittered_delay(&policy, Attempt(1), 42);
        assert_eq!(delay, Duration::from_millis(100));
    }
}
