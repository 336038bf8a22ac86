//! Operator counters
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use metrics::counter;

/// Metric names
pub mod names {
    pub const EVENTS_TOTAL: &str = "broker_operator_events_total";
    pub const DEFERRALS_TOTAL: &str = "broker_operator_deferrals_total";
    pub const RECONCILE_PASSES_TOTAL: &str = "broker_operator_reconcile_passes_total";
    pub const RESTARTS_TOTAL: &str = "broker_operator_restarts_total";
    pub const ACTIONS_TOTAL: &str = "broker_operator_actions_total";
}

pub fn record_event(event: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event).increment(1);
}

pub fn record_deferral(event: &'static str) {
    counter!(names::DEFERRALS_TOTAL, "event" => event).increment(1);
}

/// `outcome` is `unchanged`, `client` or `restart`
pub fn record_reconcile(outcome: &'static str) {
    counter!(names::RECONCILE_PASSES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_restart(action: &'static str, success: bool) {
    counter!(
        names::RESTARTS_TOTAL,
        "action" => action,
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

pub fn record_action(action: &'static str, success: bool) {
    counter!(
        names::ACTIONS_TOTAL,
        "action" => action,
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}
