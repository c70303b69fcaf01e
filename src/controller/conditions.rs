//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// The cluster has not yet completed its first election cycle
pub const CONDITION_TYPE_INITIALIZED: &str = "Initialized";
/// A master is elected, promoted and labeled
pub const CONDITION_TYPE_READY: &str = "Ready";
/// The promotion job for the desired master has been started
pub const CONDITION_TYPE_ELECTED: &str = "Elected";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        });
    }
}

/// Boolean shorthand for [`set_condition`]
pub fn set_condition_bool(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
) {
    let status = if status {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    set_condition(conditions, type_, status, reason, message);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Conditions of a cluster seen for the first time
pub fn initial_conditions() -> Vec<Condition> {
    vec![
        Condition::new(
            CONDITION_TYPE_INITIALIZED,
            true,
            "Initialized",
            "Cluster is being brought up",
        ),
        Condition::new(
            CONDITION_TYPE_READY,
            false,
            "ServiceUnavailable",
            "No master has been promoted yet",
        ),
        Condition::new(
            CONDITION_TYPE_ELECTED,
            false,
            "ServiceUnavailable",
            "No master has been elected yet",
        ),
    ]
}
