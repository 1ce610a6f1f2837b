use rand::Rng;
use std::future::Future;
use std::time::Duration;

use super::StoreError;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
}

impl Backoff {
    /// 100ms doubling, 20% jitter, 5 attempts.
    pub const fn conflict() -> Self {
        Self {
            duration: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.2,
            steps: 5,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.duration.as_secs_f64() * self.factor.powi(attempt as i32);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter) * base
        } else {
            0.0
        };
        Duration::from_secs_f64(base + jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::conflict()
    }
}

pub trait Retryable {
    fn is_conflict(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

/// Re-runs `op` while it fails with a conflict, up to `backoff.steps` attempts.
/// `op` must re-read the record it mutates on every call.
pub async fn retry_on_conflict<T, E, F, Fut>(backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < backoff.steps => {
                tokio::time::sleep(backoff.delay(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_within_jitter() {
        let b = Backoff::conflict();
        let d0 = b.delay(0);
        let d2 = b.delay(2);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(120));
        assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(480));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_steps() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = retry_on_conflict(Backoff::conflict(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::Conflict {
                    kind: "user",
                    key: "u-1".into(),
                })
            }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = retry_on_conflict(Backoff::conflict(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::not_found::<crate::models::auth::User>("u-1")) }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
