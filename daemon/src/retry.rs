//! Retry utility for blocking operations

use std::time::Duration;
use tracing::warn;

/// Retry a blocking operation with a fixed sleep between attempts.
///
/// `f` receives the 1-based attempt number. Returns `Ok` on first success, or the
/// last `Err` once `max_attempts` (at least one) attempts have failed.
pub fn retry_with_fixed_delay<F, T, E>(
    operation_name: &str,
    max_attempts: u32,
    delay: Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f(attempt) {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}; giving up",
                    operation_name, attempt, max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
