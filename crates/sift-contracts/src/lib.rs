//! Sift wire contracts.
//!
//! Everything that crosses a topic boundary lives here: the versioned
//! envelope that wraps all domain payloads, the user-activity payload,
//! and the verdict records produced by the stat and ML analysers.
//! Services depend on this crate and nothing else shared.

pub mod activity;
pub mod envelope;
pub mod verdict;

pub use activity::{ActivityType, PayloadError, UserActivityPayload, UserMetadata, DOMAIN_USER_ACTIVITY};
pub use envelope::{Envelope, EnvelopeError, SPEC_VERSION_V1};
pub use verdict::{AnomalyType, MlResult, StatVerdict, SOURCE_ML, SOURCE_STAT};
