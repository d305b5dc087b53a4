//! Retry mechanisms for transient transport failures
//!
//! A retried request is re-sent unchanged, including its request sequence
//! number, so the receiver can recognise the duplicate.

use crate::error::TransportErrorKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "serde_millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor to randomize delays
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Create a configuration for quick retries
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Retry statistics
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Total number of attempts made
    pub total_attempts: u32,
    /// Total time spent, including backoff sleeps
    pub total_retry_time: Duration,
}

/// Execute an operation, retrying transient failures until `deadline`
///
/// Non-retryable errors are returned immediately. Once attempts are exhausted
/// or the next backoff would overrun the deadline, the last error is returned.
pub async fn retry_until<F, Fut, T>(
    config: &RetryConfig,
    deadline: Instant,
    mut operation: F,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        attempt += 1;
        stats.total_attempts = attempt;

        match operation().await {
            Ok(result) => {
                stats.total_retry_time = start.elapsed();
                return (Ok(result), stats);
            }
            Err(error) => {
                if !is_retryable(&error) || attempt >= config.max_attempts {
                    stats.total_retry_time = start.elapsed();
                    return (Err(error), stats);
                }

                let delay = calculate_delay(config, attempt);
                if Instant::now() + delay >= deadline {
                    stats.total_retry_time = start.elapsed();
                    return (Err(error), stats);
                }

                tracing::debug!(
                    "Retrying after transient failure (attempt {}, delay {:?}): {}",
                    attempt,
                    delay,
                    error
                );
                sleep(delay).await;
            }
        }
    }
}

/// Check if an error is retryable
///
/// Connection failures, circuit breaking, rejected execution, dropped
/// connections and per-request timeouts are transient. Remote handler
/// failures, protocol and store errors are not.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Transport { kind, .. } => matches!(
            kind,
            TransportErrorKind::ConnectFailed
                | TransportErrorKind::NodeDisconnected
                | TransportErrorKind::CircuitBreaking
                | TransportErrorKind::Rejected
        ),
        Error::Timeout(_) => true,
        Error::Io(io_error) => {
            matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            )
        }
        _ => false,
    }
}

/// Calculate delay with exponential backoff and jitter
fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_delay =
        config.initial_delay.as_nanos() as f64 * config.backoff_multiplier.powi(attempt as i32 - 1);

    let base_delay = base_delay.min(config.max_delay.as_nanos() as f64);

    // Jitter keeps replicas of many shards from retrying in lockstep
    let jitter_range = base_delay * config.jitter_factor;
    let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;

    let final_delay = (base_delay + jitter).max(0.0) as u64;

    Duration::from_nanos(final_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(is_retryable(&Error::transport(
            TransportErrorKind::ConnectFailed,
            "refused"
        )));
        assert!(is_retryable(&Error::transport(
            TransportErrorKind::CircuitBreaking,
            "breaker"
        )));
        assert!(is_retryable(&Error::timeout("slow")));
        assert!(!is_retryable(&Error::transport(
            TransportErrorKind::Remote,
            "handler failed"
        )));
        assert!(!is_retryable(&Error::protocol("bad frame")));
        assert!(!is_retryable(&Error::cancelled("replica left")));
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_millis(500));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        let c = calls.clone();
        let (result, stats) = retry_until(&fast_config(), deadline, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transport(TransportErrorKind::Rejected, "busy"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.total_attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_terminal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        let c = calls.clone();
        let (result, _) = retry_until(&fast_config(), deadline, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::store("checksum mismatch"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_respects_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        let c = calls.clone();
        let (result, stats) = retry_until(&fast_config(), deadline, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::transport(TransportErrorKind::ConnectFailed, "down"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(stats.total_attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
