//! Stored-user-data novelty checks.
//!
//! An event's IP, user agent and country are compared against the seen-sets
//! in the user's profile. The first value with no prior sighting wins and
//! the remaining checks are skipped. Because the profile is only written
//! after detection, an event's own metadata never masks its novelty.

use super::Detection;
use sift_contracts::AnomalyType;

/// Membership of one event's metadata in the profile seen-sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataSightings {
    pub ip_known: bool,
    pub user_agent_known: bool,
    pub country_known: bool,
}

pub fn check(seen: &MetadataSightings) -> Option<Detection> {
    if !seen.ip_known {
        return Some(Detection::new(
            AnomalyType::NewIp,
            "IP address never seen before",
        ));
    }
    if !seen.user_agent_known {
        return Some(Detection::new(
            AnomalyType::NewUserAgent,
            "User agent never seen before",
        ));
    }
    if !seen.country_known {
        return Some(Detection::new(
            AnomalyType::NewCountry,
            "Country never seen before",
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_user_fires_on_ip_first() {
        let detection = check(&MetadataSightings::default()).unwrap();
        assert_eq!(detection.anomaly_type, AnomalyType::NewIp);
    }

    #[test]
    fn known_ip_falls_through_to_user_agent() {
        let seen = MetadataSightings {
            ip_known: true,
            ..Default::default()
        };
        let detection = check(&seen).unwrap();
        assert_eq!(detection.anomaly_type, AnomalyType::NewUserAgent);
    }

    #[test]
    fn country_is_checked_last() {
        let seen = MetadataSightings {
            ip_known: true,
            user_agent_known: true,
            country_known: false,
        };
        let detection = check(&seen).unwrap();
        assert_eq!(detection.anomaly_type, AnomalyType::NewCountry);
    }

    #[test]
    fn fully_known_metadata_is_quiet() {
        let seen = MetadataSightings {
            ip_known: true,
            user_agent_known: true,
            country_known: true,
        };
        assert!(check(&seen).is_none());
    }
}
