//! Retry delays with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before the next listen attempt of a listener port.
///
/// `min(standard * failures, max)`, then drawn uniformly from `[0, delay]`.
pub fn listener_retry_delay(failures: u32, standard: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let delay = standard.saturating_mul(failures).min(max);
    jitter_between(Duration::ZERO, delay)
}

/// Delay before a UDP receive instance tries to bind again.
///
/// Grows linearly with the retry count up to `cap`, jittered into `[delay/2, delay]`.
pub fn bind_retry_delay(retry: u32, base: Duration, cap: Duration) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let delay = base.saturating_mul(retry).min(cap);
    jitter_between(delay / 2, delay)
}

fn jitter_between(low: Duration, high: Duration) -> Duration {
    let low_ms = low.as_millis() as u64;
    let high_ms = high.as_millis() as u64;
    if high_ms <= low_ms {
        return high;
    }
    Duration::from_millis(rand::thread_rng().gen_range(low_ms..=high_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_delay_scales_and_caps() {
        let standard = Duration::from_millis(100);
        let max = Duration::from_millis(350);

        assert_eq!(listener_retry_delay(0, standard, max), Duration::ZERO);
        for _ in 0..100 {
            assert!(listener_retry_delay(1, standard, max) <= Duration::from_millis(100));
            assert!(listener_retry_delay(3, standard, max) <= Duration::from_millis(300));
            assert!(listener_retry_delay(50, standard, max) <= max);
        }
    }

    #[test]
    fn bind_delay_stays_within_half_window() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(30);

        for _ in 0..100 {
            let d = bind_retry_delay(4, base, cap);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));

            let capped = bind_retry_delay(10_000, base, cap);
            assert!(capped >= Duration::from_secs(15) && capped <= cap);
        }
    }
}
