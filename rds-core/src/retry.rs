//! Bounded reconnect attempts with exponential backoff
//!
//! Boards drop off the bus (USB re-enumeration, a UART adapter browning out),
//! so reopening the link is retried a few times before a recovery is declared
//! failed. Only retryable errors are retried; anything else is returned on the
//! first attempt.

use crate::{Error, Result};
use rand::Rng;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently a failing link operation is repeated
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_backoff: Duration,
    /// Upper bound for any single wait
    pub max_backoff: Duration,
    /// Growth factor applied to the wait after every failure
    pub multiplier: f64,
    /// Stretch each wait by up to a quarter, at random
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Call `operation` until it succeeds, returns a non-retryable error, or
    /// `max_attempts` calls have failed
    pub fn execute<F, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut wait = self.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Link operation recovered on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!("Giving up after {} attempts: {}", attempt, err);
                return Err(err);
            }

            warn!(
                "Attempt {}/{} failed{}: {}; next try in {:?}",
                attempt,
                self.max_attempts,
                step_suffix(&err),
                err,
                wait
            );
            if !wait.is_zero() {
                sleep(wait);
            }
            wait = self.next_wait(wait);
        }
    }

    fn next_wait(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.multiplier).min(self.max_backoff);
        if !self.jitter || grown.is_zero() {
            return grown;
        }
        let extra = rand::thread_rng().gen_range(0..=grown.as_millis() as u64 / 4);
        grown + Duration::from_millis(extra)
    }
}

fn step_suffix(err: &Error) -> String {
    err.step().map(|s| format!(" during {}", s)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LinkError, Step};

    fn dropped() -> Error {
        Error::link(Step::Reconnect, LinkError::Disconnected)
    }

    #[test]
    fn test_succeeds_on_third_attempt() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;

        let value = policy
            .execute(|| {
                calls += 1;
                if calls < 3 {
                    Err(dropped())
                } else {
                    Ok("open")
                }
            })
            .unwrap();

        assert_eq!(value, "open");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::immediate(2);
        let mut calls = 0;

        let err = policy
            .execute(|| {
                calls += 1;
                Err::<(), _>(dropped())
            })
            .unwrap_err();

        assert_eq!(err.step(), Some(Step::Reconnect));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;

        let result = policy.execute(|| {
            calls += 1;
            Err::<(), _>(Error::EmptyTrace)
        });

        assert!(matches!(result, Err(Error::EmptyTrace)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_wait_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.next_wait(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(policy.next_wait(Duration::from_millis(200)), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let wait = policy.next_wait(Duration::from_millis(400));
            assert!(wait >= Duration::from_millis(800) && wait <= Duration::from_millis(1000));
        }
    }
}
