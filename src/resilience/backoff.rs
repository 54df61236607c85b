//! Exponential backoff with optional jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryPolicy;

/// Delay before retry number `retry` (1-indexed):
/// `min(base_delay * multiplier^(retry-1), max_delay)`, plus up to 10%
/// jitter when the policy asks for it.
pub fn delay_for_retry(retry: u32, policy: &RetryPolicy) -> Duration {
    let capped = capped_delay_ms(retry, policy);

    let jitter = if policy.jitter {
        let range = capped / 10;
        if range > 0 {
            rand::thread_rng().gen_range(0..range)
        } else {
            0
        }
    } else {
        0
    };

    Duration::from_millis(capped.saturating_add(jitter))
}

/// The deterministic part of [`delay_for_retry`], in milliseconds.
pub fn capped_delay_ms(retry: u32, policy: &RetryPolicy) -> u64 {
    if retry == 0 {
        return 0;
    }

    let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
    let raw = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let max = policy.max_delay_ms as f64;

    // NaN and infinity both collapse to the cap.
    if raw.is_finite() && raw < max {
        raw as u64
    } else {
        policy.max_delay_ms
    }
}
