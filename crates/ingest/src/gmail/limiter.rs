//! Sliding-window rate limiter
//!
//! Holds `max_requests` permits. A permit taken by a request goes back into
//! the bucket one window after the request releases it, so no more than
//! `max_requests` requests start within any window.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, Semaphore};

#[derive(Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_requests.max(1))),
            window,
        }
    }

    /// `requests_per_second` permits per one-second window
    pub fn per_second(requests_per_second: usize) -> Self {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Wait for a permit
    pub async fn acquire(&self) -> Result<RatePermit, AcquireError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        permit.forget();
        Ok(RatePermit {
            permits: Arc::clone(&self.permits),
            window: self.window,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop handing out permits; waiters get an error
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A taken rate permit; returned to the bucket one window after drop
#[derive(Debug)]
pub struct RatePermit {
    permits: Arc<Semaphore>,
    window: Duration,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        let permits = Arc::clone(&self.permits);
        let window = self.window;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(window).await;
                    permits.add_permits(1);
                });
            }
            // Outside a runtime there is nothing to schedule the refill on
            Err(_) => permits.add_permits(1),
        }
    }
}
