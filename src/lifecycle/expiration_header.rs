//! `x-amz-expiration` hint parsing
//!
//! RGW answers HEAD/GET on objects covered by an expiration rule with
//!
//! ```text
//! x-amz-expiration: expiry-date="Fri, 23 Dec 2022 00:00:00 GMT", rule-id="rule1"
//! ```
//!
//! The date is the midnight following `creation + Days`, or the rule's
//! `Date` itself.

use super::Threshold;
use crate::error::CollaboratorError;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;

/// Parsed `x-amz-expiration` value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpirationHint {
    pub expiry: DateTime<Utc>,
    pub rule_id: String,
}

impl ExpirationHint {
    /// Parse the raw header value; a malformed value is bad gateway output
    pub fn parse(raw: &str) -> Result<Self, CollaboratorError> {
        let expiry_raw = quoted_field(raw, "expiry-date")
            .ok_or_else(|| invalid(raw, "missing expiry-date"))?;
        let rule_id = quoted_field(raw, "rule-id").ok_or_else(|| invalid(raw, "missing rule-id"))?;

        let expiry = DateTime::parse_from_rfc2822(expiry_raw)
            .map_err(|e| invalid(raw, &e.to_string()))?
            .with_timezone(&Utc);

        Ok(Self {
            expiry,
            rule_id: rule_id.to_string(),
        })
    }

    pub fn expiry_date(&self) -> NaiveDate {
        self.expiry.date_naive()
    }
}

fn quoted_field<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let start = raw.find(&needle)? + needle.len();
    let len = raw[start..].find('"')?;
    Some(&raw[start..start + len])
}

fn invalid(raw: &str, reason: &str) -> CollaboratorError {
    CollaboratorError::Output {
        command: "x-amz-expiration".to_string(),
        reason: format!("'{}': {}", raw, reason),
    }
}

/// Date the gateway should advertise for an object created at `created`
pub fn expected_expiry_date(threshold: Threshold, created: DateTime<Utc>) -> NaiveDate {
    match threshold {
        Threshold::Date(date) => date,
        Threshold::Days(days) => created
            .date_naive()
            .checked_add_days(Days::new(u64::from(days) + 1))
            .unwrap_or(NaiveDate::MAX),
    }
}
