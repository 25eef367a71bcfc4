//! EMA frequency deviation.
//!
//! The occurrence count of the event's type inside a type-specific window
//! is folded into two exponentially-weighted averages kept in the profile
//! store: the count itself and the absolute deviation from the established
//! baseline. The deviation is measured against the EMA *before* the new
//! observation is folded in, so the very first observation establishes the
//! baseline and can never fire.

use chrono::Duration;
use sift_contracts::ActivityType;

/// Smoothing factor for both running averages.
pub const ALPHA: f64 = 0.3;

/// Occurrence window per event type.
pub fn window_for(activity: ActivityType) -> Duration {
    match activity {
        ActivityType::Login => Duration::minutes(15),
        ActivityType::Payment => Duration::minutes(10),
        ActivityType::Logout => Duration::hours(1),
        ActivityType::FailedLogin => Duration::minutes(15),
        ActivityType::PasswordReset => Duration::hours(2),
        ActivityType::Other => Duration::hours(2),
    }
}

/// `new = α·x + (1−α)·prior`; an absent prior adopts the observation.
pub fn fold(prior: Option<f64>, observation: f64, alpha: f64) -> f64 {
    match prior {
        Some(prior) => alpha * observation + (1.0 - alpha) * prior,
        None => observation,
    }
}

/// Absolute deviation of the observation from the prior baseline.
pub fn deviation(observation: f64, prior_ema: Option<f64>) -> f64 {
    (observation - prior_ema.unwrap_or(observation)).abs()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyDecision {
    pub deviation: f64,
    pub threshold: f64,
    pub fired: bool,
    /// The deviation average is flat; no variance to score against.
    pub no_variance: bool,
}

/// Score a deviation against the updated deviation average.
///
/// A small `ema_std` would make any blip look huge, so the multiplier
/// widens from 2.5 to 4.0 below 1.0.
pub fn evaluate(deviation: f64, ema_std: f64) -> FrequencyDecision {
    let threshold = if ema_std < 1.0 { 4.0 } else { 2.5 };
    FrequencyDecision {
        deviation,
        threshold,
        fired: ema_std > 0.0 && deviation > threshold * ema_std,
        no_variance: ema_std == 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_never_fires() {
        let dev = deviation(7.0, None);
        assert_eq!(dev, 0.0);
        let decision = evaluate(dev, fold(None, dev, ALPHA));
        assert!(!decision.fired);
        assert!(decision.no_variance);
    }

    #[test]
    fn burst_over_established_baseline_fires() {
        // prior EMA 1.0, prior ema_std 0.5, observed count 5
        let dev = deviation(5.0, Some(1.0));
        assert_eq!(dev, 4.0);
        let ema_std = fold(Some(0.5), dev, ALPHA);
        assert!((ema_std - 1.55).abs() < 1e-9);
        let decision = evaluate(dev, ema_std);
        assert_eq!(decision.threshold, 2.5);
        assert!(decision.fired);
    }

    #[test]
    fn quiet_stream_stays_quiet() {
        let dev = deviation(2.0, Some(2.0));
        let decision = evaluate(dev, fold(Some(0.0), dev, ALPHA));
        assert!(!decision.fired);
        assert!(decision.no_variance);
    }

    #[test]
    fn small_std_uses_the_wide_multiplier() {
        let decision = evaluate(1.5, 0.5);
        assert_eq!(decision.threshold, 4.0);
        // 1.5 < 4.0 * 0.5
        assert!(!decision.fired);
        let decision = evaluate(2.5, 0.5);
        assert!(decision.fired);
    }

    #[test]
    fn fold_converges_on_a_constant_stream() {
        let mut ema = None;
        for _ in 0..200 {
            ema = Some(fold(ema, 3.0, ALPHA));
        }
        assert!((ema.unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn fold_tracks_a_noisy_stream() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut ema = None;
        for _ in 0..500 {
            ema = Some(fold(ema, 10.0 + rng.random_range(-1.0..1.0), ALPHA));
        }
        let ema = ema.unwrap();
        assert!(ema > 8.0 && ema < 12.0, "ema drifted to {ema}");
    }

    #[test]
    fn windows_match_the_event_types() {
        assert_eq!(window_for(ActivityType::Login), Duration::minutes(15));
        assert_eq!(window_for(ActivityType::Payment), Duration::minutes(10));
        assert_eq!(window_for(ActivityType::PasswordReset), Duration::hours(2));
    }
}
