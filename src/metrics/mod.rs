//! Metrics module
//!
//! Prometheus counters for polling behaviour. The CLI dumps them in text
//! format at the end of a run so lag regressions show up across runs.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    pub static ref POLLS_TOTAL: CounterVec = register_counter_vec!(
        "rgw_lc_harness_polls_total",
        "Observations fetched while waiting for an expectation",
        &["outcome"]  // "match" or "miss"
    ).unwrap();

    pub static ref VALIDATIONS_TOTAL: CounterVec = register_counter_vec!(
        "rgw_lc_harness_validations_total",
        "Expectation validations by result",
        &["result"]  // "success", "timeout" or "error"
    ).unwrap();

    pub static ref TIME_TO_MATCH: Histogram = register_histogram!(
        "rgw_lc_harness_lag_seconds",
        "Time between an expectation becoming eligible and being observed",
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref MARKER_VIOLATIONS: Counter = register_counter!(
        "rgw_lc_harness_delete_marker_violations_total",
        "Keys found with an unexpected number of delete markers"
    ).unwrap();
}

/// Record one fetched observation
pub fn record_poll(matched: bool) {
    let outcome = if matched { "match" } else { "miss" };
    POLLS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record the end of a validation, with its lag on success
pub fn record_validation(result: &str, lag: Option<Duration>) {
    VALIDATIONS_TOTAL.with_label_values(&[result]).inc();
    if let Some(lag) = lag {
        TIME_TO_MATCH.observe(lag.as_secs_f64());
    }
}

/// Record delete-marker violations found by a check
pub fn record_marker_violations(count: usize) {
    if count > 0 {
        MARKER_VIOLATIONS.inc_by(count as f64);
    }
}

/// Render every registered metric in Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
