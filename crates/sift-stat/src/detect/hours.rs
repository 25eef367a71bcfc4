//! Activity-hour deviation.
//!
//! The profile keeps a 24-bucket histogram of how often the user has been
//! active in each hour of the day. Hours whose count sits below one
//! standard deviation of that distribution are unusual for this user.

use super::Detection;
use sift_contracts::AnomalyType;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourStats {
    pub mean: f64,
    pub std_dev: f64,
}

/// Mean and population standard deviation over all 24 buckets,
/// missing hours counting as zero.
pub fn stats(histogram: &[u64; 24]) -> HourStats {
    let mean = histogram.iter().sum::<u64>() as f64 / 24.0;
    let variance = histogram
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / 24.0;
    HourStats {
        mean,
        std_dev: variance.sqrt(),
    }
}

pub fn check(histogram: &[u64; 24], hour: u32) -> Option<Detection> {
    let HourStats { std_dev, .. } = stats(histogram);
    let count = histogram[hour as usize % 24];

    if (count as f64) < std_dev {
        return Some(Detection::new(
            AnomalyType::TimeDeviation,
            format!("Activity at unusual hour {hour}. Count={count} < stdDev={std_dev:.2}"),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_is_quiet() {
        // A brand-new user has zero variance; nothing is unusual yet.
        assert!(check(&[0; 24], 3).is_none());
    }

    #[test]
    fn rare_hour_fires() {
        let mut histogram = [0u64; 24];
        for h in 9..17 {
            histogram[h] = 50;
        }
        let detection = check(&histogram, 3).unwrap();
        assert_eq!(detection.anomaly_type, AnomalyType::TimeDeviation);
    }

    #[test]
    fn busy_hour_is_quiet() {
        let mut histogram = [0u64; 24];
        for h in 9..17 {
            histogram[h] = 50;
        }
        assert!(check(&histogram, 12).is_none());
    }

    #[test]
    fn uniform_activity_is_quiet_everywhere() {
        let histogram = [10u64; 24];
        for hour in 0..24 {
            assert!(check(&histogram, hour).is_none());
        }
    }

    #[test]
    fn stats_use_squared_deviations() {
        let mut histogram = [0u64; 24];
        histogram[0] = 24;
        let s = stats(&histogram);
        assert!((s.mean - 1.0).abs() < 1e-9);
        // variance = (23^2 + 23*1^2)/24 = 23; std = sqrt(23)
        assert!((s.std_dev - 23f64.sqrt()).abs() < 1e-9);
    }
}
