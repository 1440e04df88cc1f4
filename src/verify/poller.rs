//! Bounded polling validator
//!
//! Replaces "sleep N seconds, then check" with a single primitive:
//!
//! 1. Reject an expectation that only becomes eligible after the maximum
//!    wait, then sleep until it is eligible (never poll early, an early
//!    observation is meaningless rather than a failure)
//! 2. Fetch an observation; stop on an exact match
//! 3. Otherwise sleep `min(interval, remaining)` and fetch again, until the
//!    maximum wait is used up
//!
//! A fetch error ends validation immediately: a broken client is not a
//! slow cluster.

use super::{Clock, Observation, PredictedState};
use crate::config::{ConfigError, PollingConfig};
use crate::error::{CollaboratorError, HarnessError, TimeoutFailure};
use crate::lifecycle::{Expectation, Prediction};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll cadence and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, max_wait: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll interval must be greater than zero".into(),
            ));
        }
        if max_wait < interval {
            return Err(ConfigError::ValidationError(format!(
                "maximum wait {:?} is shorter than the poll interval {:?}",
                max_wait, interval
            )));
        }
        Ok(Self { interval, max_wait })
    }
}

impl TryFrom<&PollingConfig> for PollSettings {
    type Error = ConfigError;

    fn try_from(config: &PollingConfig) -> Result<Self, Self::Error> {
        PollSettings::new(config.interval(), config.max_wait())
    }
}

/// A value that satisfied the predicate
#[derive(Debug, Clone)]
pub struct Polled<T> {
    pub value: T,
    pub attempts: u32,
    /// Time since polling was requested
    pub elapsed: Duration,
    /// Time since the value was allowed to be checked
    pub lag: Duration,
}

/// The last value seen before the wait ran out
#[derive(Debug, Clone)]
pub struct PollTimeout<T> {
    pub last: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Result of a bounded poll
#[derive(Debug, Clone)]
pub enum PollOutcome<T> {
    Matched(Polled<T>),
    TimedOut(PollTimeout<T>),
}

/// A validated expectation
#[derive(Debug, Clone)]
pub struct Verified {
    pub rule_id: String,
    /// State the stage predicted
    pub expected: PredictedState,
    /// State actually matched; a later stage when processing ran ahead
    pub matched: PredictedState,
    pub observation: Observation,
    pub attempts: u32,
    pub elapsed: Duration,
    pub lag: Duration,
}

/// Polls a fetch operation until it matches or the maximum wait elapses
pub struct BoundedPoller<C: Clock> {
    clock: C,
    settings: PollSettings,
}

impl<C: Clock> BoundedPoller<C> {
    pub fn new(clock: C, settings: PollSettings) -> Self {
        Self { clock, settings }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Poll `fetch` until `accept` holds, starting no earlier than `not_before`.
    ///
    /// The maximum wait is counted from the call, so a `not_before` beyond
    /// it can never be satisfied and is rejected up front.
    pub fn poll_until<T, F, P>(
        &self,
        not_before: DateTime<Utc>,
        mut fetch: F,
        mut accept: P,
    ) -> Result<PollOutcome<T>, HarnessError>
    where
        T: fmt::Debug,
        F: FnMut() -> Result<T, CollaboratorError>,
        P: FnMut(&T) -> bool,
    {
        let start = self.clock.now();
        let deadline = start + to_chrono(self.settings.max_wait);
        if not_before > deadline {
            return Err(ConfigError::ValidationError(format!(
                "expectation eligible at {} but maximum wait ends at {}",
                not_before.to_rfc3339(),
                deadline.to_rfc3339()
            ))
            .into());
        }

        self.clock.sleep_until(not_before);

        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            let value = fetch()?;
            let now = self.clock.now();
            let elapsed = non_negative(now - start);
            debug!(attempt = attempts, elapsed = ?elapsed, value = ?value, "Polled");

            if accept(&value) {
                crate::metrics::record_poll(true);
                return Ok(PollOutcome::Matched(Polled {
                    value,
                    attempts,
                    elapsed,
                    lag: non_negative(now - not_before),
                }));
            }
            crate::metrics::record_poll(false);

            if now >= deadline {
                return Ok(PollOutcome::TimedOut(PollTimeout {
                    last: value,
                    attempts,
                    elapsed,
                }));
            }

            let remaining = non_negative(deadline - now);
            self.clock.sleep(self.settings.interval.min(remaining));
        }
    }

    /// Validate a single expectation against fresh observations
    pub fn validate<F>(&self, expectation: &Expectation, fetch: F) -> Result<Verified, HarnessError>
    where
        F: FnMut() -> Result<Observation, CollaboratorError>,
    {
        let state = &expectation.state;
        let outcome = self.poll_until(expectation.eligible_after, fetch, |obs: &Observation| {
            state.matches(obs)
        });

        match outcome {
            Ok(PollOutcome::Matched(polled)) => {
                info!(
                    rule_id = %expectation.rule_id,
                    state = %state,
                    attempts = polled.attempts,
                    lag = ?polled.lag,
                    "Expectation verified"
                );
                crate::metrics::record_validation("success", Some(polled.lag));
                Ok(Verified {
                    rule_id: expectation.rule_id.clone(),
                    expected: state.clone(),
                    matched: state.clone(),
                    observation: polled.value,
                    attempts: polled.attempts,
                    elapsed: polled.elapsed,
                    lag: polled.lag,
                })
            }
            Ok(PollOutcome::TimedOut(timeout)) => {
                crate::metrics::record_validation("timeout", None);
                Err(timed_out(expectation, timeout))
            }
            Err(err) => {
                crate::metrics::record_validation("error", None);
                Err(err)
            }
        }
    }

    /// Validate every stage of a predicted schedule in order.
    ///
    /// The maximum wait of a stage counts from the moment the previous stage
    /// matched (or from the call, for the first stage), so a stage eligible
    /// beyond that window is rejected up front like in [`Self::validate`].
    /// Reported elapsed times are measured from the call.
    ///
    /// A stage also counts as reached when the object already shows a later,
    /// eligible stage, since background processing may run ahead of the
    /// harness.
    pub fn validate_schedule<F>(
        &self,
        prediction: &Prediction,
        mut fetch: F,
    ) -> Result<Vec<Verified>, HarnessError>
    where
        F: FnMut() -> Result<Observation, CollaboratorError>,
    {
        let start = self.clock.now();
        let stages = prediction.expectations();
        let mut verified = Vec::with_capacity(stages.len());
        let mut index = 0;

        while index < stages.len() {
            let stage = &stages[index];
            let remaining = &stages[index..];

            let outcome = self.poll_until(stage.eligible_after, &mut fetch, |obs: &Observation| {
                furthest_match(remaining, obs).is_some()
            });
            let elapsed = non_negative(self.clock.now() - start);

            match outcome {
                Ok(PollOutcome::Matched(polled)) => {
                    let offset = furthest_match(remaining, &polled.value).unwrap_or(0);
                    let matched = &remaining[offset];
                    if offset > 0 {
                        warn!(
                            expected = %stage.state,
                            observed = %matched.state,
                            "Lifecycle ran ahead; stage satisfied by a later state"
                        );
                    }
                    crate::metrics::record_validation("success", Some(polled.lag));
                    verified.push(Verified {
                        rule_id: matched.rule_id.clone(),
                        expected: stage.state.clone(),
                        matched: matched.state.clone(),
                        observation: polled.value,
                        attempts: polled.attempts,
                        elapsed,
                        lag: polled.lag,
                    });
                    index += offset + 1;
                }
                Ok(PollOutcome::TimedOut(timeout)) => {
                    crate::metrics::record_validation("timeout", None);
                    return Err(timed_out(stage, PollTimeout { elapsed, ..timeout }));
                }
                Err(err) => {
                    crate::metrics::record_validation("error", None);
                    return Err(err);
                }
            }
        }

        Ok(verified)
    }
}

/// Index of the furthest stage the observation satisfies. The first stage
/// is already eligible; later ones only count once their time has come.
fn furthest_match(stages: &[Expectation], observation: &Observation) -> Option<usize> {
    stages
        .iter()
        .enumerate()
        .rev()
        .find(|(i, stage)| {
            (*i == 0 || stage.is_eligible(observation.observed_at))
                && stage.state.matches(observation)
        })
        .map(|(i, _)| i)
}

fn timed_out(expectation: &Expectation, timeout: PollTimeout<Observation>) -> HarnessError {
    TimeoutFailure {
        rule_id: expectation.rule_id.clone(),
        expected: expectation.state.clone(),
        last: timeout.last,
        attempts: timeout.attempts,
        elapsed: timeout.elapsed,
    }
    .into()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn non_negative(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or_default()
}
