use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RetryError {
    #[error("condition not met after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("wait cancelled")]
    Cancelled,
}

/// Fixed-interval polling, optionally bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` polls until the condition holds or the wait is cancelled.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn forever(interval: Duration) -> Self {
        RetryPolicy {
            interval,
            max_attempts: None,
        }
    }

    pub const fn bounded(interval: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    /// Poll `ready` until it returns true.
    ///
    /// `on_wait` runs after every failed attempt, before sleeping. Returns the
    /// number of attempts it took.
    pub async fn wait_until<R, W>(
        &self,
        cancel: &CancellationToken,
        mut ready: R,
        mut on_wait: W,
    ) -> Result<u32, RetryError>
    where
        R: FnMut() -> bool,
        W: FnMut(u32),
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
            if ready() {
                return Ok(attempt);
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RetryError::Exhausted { attempts: attempt });
            }
            on_wait(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
