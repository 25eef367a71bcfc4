//! Rule-table transition validity.

use super::Detection;
use sift_contracts::{ActivityType, AnomalyType, UserActivityPayload};

/// Allowed successor table. The rules are data, not a total match: a
/// previous event type with no row yields `unknown_transition_rule`.
const TRANSITION_RULES: &[(ActivityType, &[ActivityType])] = &[
    (
        ActivityType::Login,
        &[
            ActivityType::Payment,
            ActivityType::Logout,
            ActivityType::FailedLogin,
        ],
    ),
    (
        ActivityType::Payment,
        &[ActivityType::Logout, ActivityType::Other],
    ),
    (ActivityType::Logout, &[ActivityType::Login]),
    (
        ActivityType::FailedLogin,
        &[ActivityType::Login, ActivityType::PasswordReset],
    ),
    (ActivityType::PasswordReset, &[ActivityType::Login]),
    (
        ActivityType::Other,
        &[ActivityType::Logout, ActivityType::Login],
    ),
];

pub fn allowed_next(previous: ActivityType) -> Option<&'static [ActivityType]> {
    TRANSITION_RULES
        .iter()
        .find(|(from, _)| *from == previous)
        .map(|(_, next)| *next)
}

/// Validate the transition from the newest stored event to the current one.
/// A user with no history has nothing to validate.
pub fn check(
    previous: Option<&UserActivityPayload>,
    current: &UserActivityPayload,
) -> Option<Detection> {
    let previous = previous?;

    let Some(allowed) = allowed_next(previous.activity) else {
        return Some(Detection::new(
            AnomalyType::UnknownTransitionRule,
            format!(
                "No transition rule for previous event type {}",
                previous.activity
            ),
        ));
    };

    if allowed.contains(&current.activity) {
        return None;
    }

    Some(Detection::new(
        AnomalyType::InvalidTransition,
        format!(
            "Disallowed transition: {}->{}",
            previous.activity, current.activity
        ),
    ))
}
