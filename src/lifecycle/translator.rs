//! Rule-to-expectation translation
//!
//! Given the rules of a bucket and one target object, predicts when each
//! rule's effect becomes observable and what the object looks like then.
//!
//! # Ordering
//!
//! Expectations are sorted by eligible-after time. At equal instants an
//! expiration sorts before a transition. The first terminal expectation
//! closes the schedule: an expired object cannot transition afterwards.
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use rgw_lc_harness::lifecycle::{
//!     AccelerationFactor, Action, Rule, RuleFilter, TargetObject, Threshold, Translator,
//! };
//!
//! let translator = Translator::new(AccelerationFactor::seconds_per_day(10).unwrap());
//! let rule = Rule {
//!     id: "expire".into(),
//!     filter: RuleFilter { prefix: Some("key1".into()), ..Default::default() },
//!     action: Action::Expire,
//!     threshold: Threshold::Days(1),
//!     enabled: true,
//! };
//! let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let object = TargetObject::new("key1.bucket.0", created);
//!
//! let prediction = translator.translate(&[rule], &object);
//! let first = &prediction.expectations()[0];
//! assert_eq!((first.eligible_after - created).num_seconds(), 10);
//! ```

use super::{AccelerationFactor, Action, Rule, TargetObject, Threshold};
use crate::verify::PredictedState;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;

/// A predicted state and the earliest time it may be checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Expectation {
    pub rule_id: String,
    pub eligible_after: DateTime<Utc>,
    pub state: PredictedState,
    pub terminal: bool,
}

impl Expectation {
    /// Observations before this instant say nothing about the rule
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.eligible_after
    }
}

/// Outcome of translating a rule set against one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "prediction", content = "schedule", rename_all = "snake_case")]
pub enum Prediction {
    /// No enabled rule matches the object; it must stay untouched
    Exempt,
    /// Expectations in the order they take effect
    Scheduled(Vec<Expectation>),
}

impl Prediction {
    pub fn is_exempt(&self) -> bool {
        matches!(self, Prediction::Exempt)
    }

    pub fn expectations(&self) -> &[Expectation] {
        match self {
            Prediction::Exempt => &[],
            Prediction::Scheduled(expectations) => expectations,
        }
    }

    /// Predicted state at `at`, `None` while nothing is eligible yet
    pub fn state_at(&self, at: DateTime<Utc>) -> Option<&PredictedState> {
        self.expectations()
            .iter()
            .take_while(|e| e.is_eligible(at))
            .last()
            .map(|e| &e.state)
    }

    /// The first expectation not yet eligible at `at`
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<&Expectation> {
        self.expectations().iter().find(|e| !e.is_eligible(at))
    }

    /// Where the object ends up once every rule has acted
    pub fn final_expectation(&self) -> Option<&Expectation> {
        self.expectations().last()
    }
}

/// Translates rules into expectations for a given acceleration factor
#[derive(Debug, Clone, Copy)]
pub struct Translator {
    factor: AccelerationFactor,
}

impl Translator {
    pub fn new(factor: AccelerationFactor) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> AccelerationFactor {
        self.factor
    }

    /// Earliest time the rule can have acted on the object
    pub fn eligible_after(&self, rule: &Rule, object: &TargetObject) -> DateTime<Utc> {
        let base = object.base_time(&rule.action);
        match rule.threshold {
            // Saturates; the poller rejects anything past its maximum wait
            Threshold::Days(days) => base
                .checked_add_signed(self.factor.scale(days))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Threshold::Date(date) => {
                let midnight = Utc.from_utc_datetime(&date.and_time(NaiveTime::default()));
                midnight.max(base)
            }
        }
    }

    /// Expectation for a single rule, `None` when the rule does not apply
    pub fn expectation_for(&self, rule: &Rule, object: &TargetObject) -> Option<Expectation> {
        if !rule.applies_to(object) {
            return None;
        }

        let state = match &rule.action {
            Action::Expire if object.versioned => PredictedState::DeleteMarkerCreated,
            Action::Expire | Action::ExpireNoncurrent => PredictedState::Deleted,
            Action::Transition { storage_class }
            | Action::TransitionNoncurrent { storage_class } => {
                PredictedState::Tier(storage_class.clone())
            }
        };

        Some(Expectation {
            rule_id: rule.id.clone(),
            eligible_after: self.eligible_after(rule, object),
            state,
            terminal: rule.action.is_terminal(),
        })
    }

    /// Predict the object's schedule under all rules
    pub fn translate(&self, rules: &[Rule], object: &TargetObject) -> Prediction {
        let mut candidates: Vec<Expectation> = rules
            .iter()
            .filter_map(|rule| self.expectation_for(rule, object))
            .collect();

        if candidates.is_empty() {
            return Prediction::Exempt;
        }

        candidates.sort_by(|a, b| {
            a.eligible_after
                .cmp(&b.eligible_after)
                .then_with(|| b.terminal.cmp(&a.terminal))
        });

        let mut schedule = Vec::with_capacity(candidates.len());
        for expectation in candidates {
            let terminal = expectation.terminal;
            schedule.push(expectation);
            if terminal {
                break;
            }
        }

        tracing::debug!(
            key = %object.key,
            stages = schedule.len(),
            "Translated lifecycle schedule"
        );

        Prediction::Scheduled(schedule)
    }
}
