use std::time::Duration;

pub use backon::{Backoff, ExponentialBackoff};
use backon::{BackoffBuilder, ExponentialBuilder};

/// Doubling backoff between `min_delay` and `max_delay` that never gives up
///
/// The delays are `min_delay`, `2 * min_delay`, `4 * min_delay`, ... capped
/// at `max_delay`. No jitter is applied so the schedule is predictable.
pub fn doubling_backoff(min_delay: Duration, max_delay: Duration) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_factor(2.0)
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_max_times(usize::MAX)
        .build()
}
