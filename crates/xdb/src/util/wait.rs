use crate::util::errors::{Error, Result};
use std::future::Future;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Bounds for a fixed-interval poll.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Polls `condition` until it yields a value, fails, or the timeout elapses.
///
/// `Ok(Some(v))` finishes the poll, `Ok(None)` keeps waiting and `Err` aborts it.
/// The condition is checked once immediately. Elapsed time is measured on the
/// monotonic clock, so a slow check only shortens the remaining budget.
pub async fn poll_until<F, Fut, T>(context: &str, config: PollConfig, mut condition: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 1;
    loop {
        if let Some(value) = condition().await? {
            debug!(context, attempt, elapsed_ms = start.elapsed().as_millis(), "condition satisfied");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Err(Error::Timeout(format!(
                "{context}: not satisfied after {attempt} checks ({:.1}s)",
                elapsed.as_secs_f64()
            )));
        }

        sleep(config.interval.min(config.timeout - elapsed)).await;
        attempt += 1;
    }
}
