use std::time::Duration;

use anyhow::Error;

/// Retry a transient operation with exponential backoff.
///
/// Runs `op` up to `attempts` times, doubling the delay between attempts.
/// The last error is returned once the budget is exhausted.
pub fn retry_with_backoff<T, F>(
    description: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut delay = base_delay;
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt < attempts {
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        description,
                        attempt,
                        attempts,
                        delay,
                        err
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                last_error = Some(err);
            }
        }
    }
    Err(last_error.expect("retry loop ran at least once"))
}
