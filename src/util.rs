//! Shared async helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::{Error, Result};

/// Await `fut`, failing with [`Error::Timeout`] once `duration` elapses.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Run `op` up to `attempts` times, doubling `delay` between tries.
/// Returns the last error if every attempt fails.
pub async fn retry_with_backoff<F, Fut, T>(attempts: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut wait = delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "retrying after failure");
                sleep(wait).await;
                wait = wait.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
