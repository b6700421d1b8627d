use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
pub struct RetryConfig {
    // 0 means no limit
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds, the attempts are exhausted,
/// or it fails with an error `retryable` rejects.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(res) => return Ok(res),
            Err(e) => {
                if !retryable(&e) {
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Per item exponential backoff used by work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    // Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn works_retry_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<u32, String> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("conflict".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fails_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<(), String> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("conflict".to_string())
            }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<(), String> =
            retry_with_backoff_if(&fast(5), "op", |e: &String| e == "conflict", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden".to_string())
                }
            })
            .await;
        assert_eq!(res, Err("forbidden".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[rstest(
        failures,
        expected,
        case(0, Duration::ZERO),
        case(1, Duration::from_secs(1)),
        case(2, Duration::from_secs(2)),
        case(5, Duration::from_secs(16)),
        case(9, Duration::from_secs(256)),
        case(10, Duration::from_secs(300)),
        case(40, Duration::from_secs(300)),
    )]
    fn works_exponential_backoff(failures: u32, expected: Duration) {
        assert_eq!(ExponentialBackoff::default().delay(failures), expected);
    }
}
