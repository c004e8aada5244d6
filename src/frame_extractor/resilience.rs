//! 重试与超时策略
//!
//! 可恢复错误按 `base_delay * 2^attempt` 退避重试，并加入均匀抖动；
//! 不可恢复错误立即返回。

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::warn;
use rand::Rng;
use thiserror::Error;

use crate::core::config::RetryConfig;
use crate::core::error::{KeyframeError, Result};

/// Reads that exhaust their retries this many times in a row end the stream.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 16;

/// A successful call plus the delays slept before it succeeded.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub delays: Vec<Duration>,
}

impl<T> Retried<T> {
    pub fn retries(&self) -> u32 {
        self.delays.len() as u32
    }
}

#[derive(Debug, Error)]
#[error("{error} (after {} retries)", delays.len())]
pub struct RetryError {
    #[source]
    pub error: KeyframeError,
    pub delays: Vec<Duration>,
}

impl RetryError {
    pub fn retries(&self) -> u32 {
        self.delays.len() as u32
    }

    pub fn is_recoverable(&self) -> bool {
        self.error.is_recoverable()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f32,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 0.99),
            timeout: config.frame_timeout(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Un-jittered delay before retry number `attempt + 1`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 抖动后的退避时间，落在 nominal * [1 - jitter, 1 + jitter]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread as f64)
    }

    pub fn call<T, F>(&self, operation: &str, mut op: F) -> std::result::Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Result<T>,
    {
        let mut delays = Vec::new();
        for attempt in 0..=self.attempts {
            match op() {
                Ok(value) => return Ok(Retried { value, delays }),
                Err(e) if e.is_recoverable() && attempt < self.attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "🔄 {} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        attempt + 1,
                        self.attempts + 1,
                        delay,
                        e
                    );
                    thread::sleep(delay);
                    delays.push(delay);
                }
                Err(error) => return Err(RetryError { error, delays }),
            }
        }
        // 0..=attempts 的最后一轮总会返回
        Err(RetryError {
            error: KeyframeError::Transient(format!("{} exhausted retries", operation)),
            delays,
        })
    }

    /// Like [`call`](Self::call), but every attempt runs on its own thread and
    /// is abandoned with `Timeout` once the per-attempt timeout elapses.
    pub fn call_with_timeout<T, F>(
        &self,
        operation: &str,
        op: F,
    ) -> std::result::Result<Retried<T>, RetryError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Clone + Send + 'static,
    {
        let timeout = self.timeout;
        self.call(operation, || {
            let (tx, rx) = mpsc::channel();
            let attempt = op.clone();
            thread::Builder::new()
                .name("keyframe-io".to_string())
                .spawn(move || {
                    let _ = tx.send(attempt());
                })?;
            match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(KeyframeError::Timeout(timeout)),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(KeyframeError::Transient(
                    "I/O worker exited without a result".to_string(),
                )),
            }
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::video::{Frame, FrameSource, VideoMetadata};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn create_policy(attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            retry_attempts: attempts,
            base_delay_ms: base_ms,
            max_delay_ms: 1_000,
            jitter: 0.25,
            frame_timeout_ms: 200,
            ..Default::default()
        })
    }

    /// 前 `failures` 次读取返回瞬时错误
    struct FlakySource {
        metadata: VideoMetadata,
        failures: u32,
        calls: u32,
    }

    impl FrameSource for FlakySource {
        fn metadata(&self) -> &VideoMetadata {
            &self.metadata
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.calls += 1;
            if self.calls <= self.failures {
                return Err(KeyframeError::Transient("decoder busy".into()));
            }
            Ok(Some(Frame::new(2, 2, vec![0u8; 16], 0, 0)))
        }

        fn skip_frame(&mut self) -> Option<u64> {
            None
        }
    }

    #[test]
    fn test_read_succeeds_after_two_failures() {
        let policy = create_policy(3, 10);
        let mut source = FlakySource {
            metadata: VideoMetadata {
                frame_count: Some(1),
                fps: 25.0,
                width: 2,
                height: 2,
                codec: "test".into(),
            },
            failures: 2,
            calls: 0,
        };

        let retried = policy.call("read frame", || source.next_frame()).unwrap();
        assert!(retried.value.is_some());
        assert_eq!(retried.retries(), 2);
        assert_eq!(source.calls, 3);

        let first = retried.delays[0].as_secs_f64() * 1000.0;
        let second = retried.delays[1].as_secs_f64() * 1000.0;
        assert!((7.5..=12.5).contains(&first), "first delay {} ms", first);
        assert!((15.0..=25.0).contains(&second), "second delay {} ms", second);
    }

    #[test]
    fn test_exhausted_retries_surface_error() {
        let policy = create_policy(2, 1);
        let calls = AtomicU32::new(0);
        let err = policy
            .call("write", || -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KeyframeError::Timeout(Duration::from_millis(1)))
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.retries(), 2);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_non_recoverable_aborts_immediately() {
        let policy = create_policy(5, 1);
        let calls = AtomicU32::new(0);
        let err = policy
            .call("read frame", || -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KeyframeError::Decode("moov atom missing".into()))
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.delays.is_empty());
        assert!(matches!(err.error, KeyframeError::Decode(_)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 500,
            jitter: 0.0,
            ..Default::default()
        });
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(500));
        assert_eq!(policy.nominal_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_slow_attempt_times_out_then_recovers() {
        let policy = create_policy(2, 1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let retried = policy
            .call_with_timeout("write", move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(600));
                }
                Ok(7u32)
            })
            .unwrap();
        assert_eq!(retried.value, 7);
        assert_eq!(retried.retries(), 1);
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
