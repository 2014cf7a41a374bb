//! Bounded retry expressed as a state machine:
//! ATTEMPTING → BACKOFF → ATTEMPTING → … → DONE | EXHAUSTED.
//!
//! [`RetryMachine`] holds the transitions and is pure; [`run`] drives it
//! against an operation and a [`Clock`], so tests never sleep.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::board::ApiError;
use crate::gateway::rate_limit::Clock;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based). `unit` in `[0, 1)`
    /// drives jitter: the delay is scaled into `[50%, 100%]` of its value.
    /// A server hint is honoured when it asks for longer.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>, unit: f64) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            capped * (0.5 + unit.clamp(0.0, 1.0) / 2.0)
        } else {
            capped
        };
        let delay = Duration::from_secs_f64(scaled.max(0.0));
        match hint {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Backoff {
        attempt: u32,
        delay: Duration,
        last_error: ApiError,
    },
    Exhausted {
        attempts: u32,
        last_error: ApiError,
    },
    Done { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 1 },
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    pub fn on_success(&mut self) -> &RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Done { attempts: attempt };
        }
        &self.state
    }

    pub fn on_failure(&mut self, error: ApiError, jitter_unit: f64) -> &RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = if !error.is_transient() || attempt >= self.policy.max_attempts {
                RetryState::Exhausted {
                    attempts: attempt,
                    last_error: error,
                }
            } else {
                let delay = self
                    .policy
                    .delay_for(attempt, error.retry_after(), jitter_unit);
                RetryState::Backoff {
                    attempt,
                    delay,
                    last_error: error,
                }
            };
        }
        &self.state
    }

    pub fn on_backoff_elapsed(&mut self) -> &RetryState {
        if let RetryState::Backoff { attempt, .. } = self.state {
            self.state = RetryState::Attempting {
                attempt: attempt + 1,
            };
        }
        &self.state
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ApiError>,
    pub attempts: u32,
}

/// Drive `op` through the retry machine. `op` receives the 1-based attempt.
pub async fn run<T, F, Fut>(policy: &RetryPolicy, clock: &dyn Clock, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut machine = RetryMachine::new(policy.clone());
    loop {
        match machine.state().clone() {
            RetryState::Attempting { attempt } => match op(attempt).await {
                Ok(value) => {
                    machine.on_success();
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    machine.on_failure(err, rand::random::<f64>());
                }
            },
            RetryState::Backoff {
                attempt,
                delay,
                last_error,
            } => {
                debug!(attempt, ?delay, error = %last_error, "transient failure; backing off");
                clock.sleep(delay).await;
                machine.on_backoff_elapsed();
            }
            RetryState::Exhausted {
                attempts,
                last_error,
            } => {
                return RetryOutcome {
                    result: Err(last_error),
                    attempts,
                }
            }
            RetryState::Done { .. } => unreachable!("run returns on success"),
        }
    }
}
