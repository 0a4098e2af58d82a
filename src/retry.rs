use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-delay retry: up to `max_attempts` tries, sleeping `backoff` in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Try exactly once.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Attempts actually made; a policy of zero still tries once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Runs `op` (given the 1-based attempt number) until it succeeds or the
    /// attempts run out, returning the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        backoff = ?self.backoff,
                        "{what} failed, retrying: {e:#}"
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
