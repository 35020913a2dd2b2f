//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Condition, StackPhase};

/// Standard condition types following Kubernetes conventions
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips, so re-applying the
/// same condition leaves the list unchanged.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Utc::now().to_rfc3339();
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == CONDITION_STATUS_TRUE)
}

/// Set Ready, Progressing and Degraded to reflect a Stack phase
pub fn set_phase_conditions(
    conditions: &mut Vec<Condition>,
    phase: StackPhase,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let flag = |on: bool| {
        if on {
            CONDITION_STATUS_TRUE
        } else {
            CONDITION_STATUS_FALSE
        }
    };

    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        flag(phase == StackPhase::Available),
        reason,
        message,
        observed_generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        flag(matches!(phase, StackPhase::Pending | StackPhase::Progressing)),
        reason,
        message,
        observed_generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        flag(phase == StackPhase::Failure),
        reason,
        message,
        observed_generation,
    );
}
