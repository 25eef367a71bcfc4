//! Markov transition surprise.
//!
//! Estimates the empirical conditional probability of the current event
//! type given its recent predecessors, against a transition histogram.
//! Four stages are tried in order, each gated on a minimum sample count;
//! the first stage with enough data decides either way:
//!
//! 1. second-order, user histogram
//! 2. first-order, user histogram
//! 3. second-order, global histogram
//! 4. first-order, global histogram

use super::Detection;
use sift_contracts::{ActivityType, AnomalyType, UserActivityPayload};
use std::collections::HashMap;

/// Below this many observations a stage cannot decide.
const MIN_SAMPLES: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Baseline {
    User,
    Global,
}

impl Baseline {
    fn label(&self) -> &'static str {
        match self {
            Self::User => "user history",
            Self::Global => "global history",
        }
    }
}

const STAGES: [(usize, Baseline); 4] = [
    (2, Baseline::User),
    (1, Baseline::User),
    (2, Baseline::Global),
    (1, Baseline::Global),
];

/// Sum of counts for entries under `prefix` with exactly `order` arrows,
/// and the count of the one entry ending in `target`.
fn stage_tally(
    histogram: &HashMap<String, u64>,
    prefix: &str,
    order: usize,
    target: ActivityType,
) -> (u64, u64) {
    let specific = format!("{prefix}{target}");
    let mut total = 0;
    let mut count = 0;
    for (key, value) in histogram {
        if !key.starts_with(prefix) || key.matches("->").count() != order {
            continue;
        }
        total += *value;
        if *key == specific {
            count = *value;
        }
    }
    (total, count)
}

/// Probability threshold for a stage, adapted to the sample size.
fn stage_threshold(total: u64) -> f64 {
    if total < 50 {
        0.02
    } else if total > 200 {
        0.05
    } else {
        (1.0 / (total as f64).sqrt()).max(0.01)
    }
}

/// `recent` is the stored history, newest first, fetched before the
/// current event was appended.
pub fn check(
    recent: &[UserActivityPayload],
    current: ActivityType,
    user_histogram: &HashMap<String, u64>,
    global_histogram: &HashMap<String, u64>,
) -> Option<Detection> {
    let prev1 = recent.first().map(|e| e.activity)?;
    let prev2 = recent.get(1).map(|e| e.activity);

    for (order, baseline) in STAGES {
        let prefix = match order {
            2 => match prev2 {
                Some(prev2) => format!("{prev2}->{prev1}->"),
                None => continue,
            },
            _ => format!("{prev1}->"),
        };

        let histogram = match baseline {
            Baseline::User => user_histogram,
            Baseline::Global => global_histogram,
        };

        let (total, count) = stage_tally(histogram, &prefix, order, current);
        if total < MIN_SAMPLES {
            continue;
        }

        let probability = count as f64 / total as f64;
        let threshold = stage_threshold(total);
        if probability < threshold {
            return Some(Detection::new(
                AnomalyType::MarkovLowProbability,
                format!(
                    "Unusual transition {prefix}{current}: p={probability:.4} below {threshold:.4} ({})",
                    baseline.label()
                ),
            ));
        }
        // Enough data and an unremarkable probability settles it.
        return None;
    }

    None
}
