//! Waiting for devices that may appear late

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use a55lib::{LinkError, LinkResult};
use log::{info, warn};

use crate::config::constants::ACQUIRE_LOG_EVERY;

/// Sleep up to `total`, returning early once `running` clears.
/// Returns false if the wait was cut short.
pub fn sleep_while_running(running: &AtomicBool, total: Duration, step: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(step.min(deadline - now));
    }
}

/// Keep calling `open` until it succeeds or the daemon stops.
///
/// Failures are logged on the first attempt and every tenth after. A
/// configuration error is returned at once since retrying cannot fix it.
/// Returns `Ok(None)` if `running` cleared first.
pub fn wait_for_resource<F, T>(
    mut open: F,
    retry: Duration,
    running: &AtomicBool,
    resource_name: &str,
) -> LinkResult<Option<T>>
where
    F: FnMut() -> LinkResult<T>,
{
    let step = Duration::from_millis(50).min(retry.max(Duration::from_millis(1)));
    let mut attempt: u32 = 0;

    while running.load(Ordering::SeqCst) {
        attempt += 1;
        match open() {
            Ok(resource) => {
                info!("{} ready after {} attempt(s)", resource_name, attempt);
                return Ok(Some(resource));
            }
            Err(e @ LinkError::Config(_)) => return Err(e),
            Err(e) => {
                if attempt == 1 || attempt % ACQUIRE_LOG_EVERY == 0 {
                    warn!("Waiting for {} (attempt {}): {}", resource_name, attempt, e);
                }
                if !sleep_while_running(running, retry, step) {
                    break;
                }
            }
        }
    }

    Ok(None)
}
