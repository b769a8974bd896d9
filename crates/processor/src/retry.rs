//! Bounded retry with exponential backoff.
//!
//! The status writer retries CAS conflicts at 500 ms x 3 and the global
//! watcher retries its initial read up to 5 times; both use this helper.
//! Closures should capture owned handles (`Arc` clones) so each attempt's
//! future is self-contained.

use std::future::Future;
use std::time::Duration;

/// Outcome classification for one attempt.
pub enum RetryError<E> {
    /// Stop immediately; retrying cannot help.
    Permanent(E),
    /// Worth another attempt after backoff.
    Transient(E),
}

/// Run `f` up to `max_attempts` times, sleeping `base_delay`, doubling after
/// every failed attempt. Returns the first success, the first permanent
/// error, or the last transient error.
pub async fn run<T, E, F, Fut>(base_delay: Duration, max_attempts: usize, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
{
    let mut delay = base_delay;
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(e)) => return Err(e),
            Err(RetryError::Transient(e)) => {
                if attempt == attempts {
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
    unreachable!("retry loop returns within its bounds")
}
