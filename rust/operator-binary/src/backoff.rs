use std::{fmt::Display, future::Future, time::Duration};

pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Bounded exponential backoff used for every Kubernetes write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_BACKOFF,
            cap: DEFAULT_MAX_BACKOFF,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempts` failures.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The error was not worth retrying.
    Permanent(E),
    /// Every attempt failed with a retryable error.
    Exhausted { last: E, attempts: u32 },
}

/// Runs `op` until it succeeds, fails permanently or `policy.max_attempts` is reached.
///
/// `description` identifies the operation in log messages.
pub async fn retry<T, E, O, F>(
    policy: &RetryPolicy,
    mut op: O,
    is_transient: impl Fn(&E) -> bool,
    description: &str,
) -> Result<T, RetryError<E>>
where
    E: Display,
    O: FnMut() -> F,
    F: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!("{description} succeeded after {attempts} attempts");
                }
                return Ok(value);
            }
            Err(err) if !is_transient(&err) => return Err(RetryError::Permanent(err)),
            Err(err) if attempts >= max_attempts => {
                tracing::warn!("{description} still failed after {attempts} attempts, giving up: {err}");
                return Err(RetryError::Exhausted {
                    last: err,
                    attempts,
                });
            }
            Err(err) => {
                let delay = policy.delay(attempts);
                tracing::info!(
                    "{description} failed, retrying in {delay:?} (attempt {attempts}): {err}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
