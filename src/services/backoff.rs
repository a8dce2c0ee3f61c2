use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
pub fn delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |d| d.min(max))
}
