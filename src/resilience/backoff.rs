//! Exponential backoff with jitter.

use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `min(cap, base · 2^attempt · U[0.5, 1.5))`.
pub fn jittered_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
    let jittered = exponential * (0.5 + fastrand::f64());
    Duration::from_secs_f64(jittered.min(cap.as_secs_f64()))
}

/// Delay honouring an upstream `Retry-After` hint: `hint · U[1.0, 1.5)`, never shorter.
pub fn retry_after_delay(hint: Duration) -> Duration {
    hint.mul_f64(1.0 + fastrand::f64() * 0.5)
}
