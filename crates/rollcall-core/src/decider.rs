//! Identity assignment and cooldown gating for attendance events.
//!
//! The cooldown is a fixed window after the last successful log, measured on
//! the monotonic clock. Calendar boundaries and wall-clock adjustments do not
//! affect it: someone logged at 23:58 is not logged again at 00:02 with the
//! default five-minute window.

use crate::capture::elapsed_exceeds;
use crate::gallery::{EuclideanMatcher, Gallery, MatchResult, Matcher};
use crate::types::Encoding;
use chrono::Duration;
use std::collections::HashMap;
use std::time::Instant;

/// Default maximum Euclidean distance for a match. Lower is stricter.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.6;
/// Default minimum time between two events for the same identity.
pub const DEFAULT_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, Copy)]
pub struct DeciderConfig {
    pub match_threshold: f64,
    pub cooldown: Duration,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// Outcome for a single detected face.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Unknown {
        nearest_distance: Option<f64>,
    },
    /// Known face, but logged too recently.
    WithinCooldown {
        identity_id: String,
        display_name: String,
        distance: f64,
    },
    /// Known face that should produce an attendance event.
    Eligible {
        identity_id: String,
        display_name: String,
        distance: f64,
    },
}

/// Owns the gallery and the process-local last-logged map for one session.
pub struct AttendanceDecider<M: Matcher = EuclideanMatcher> {
    gallery: Gallery,
    matcher: M,
    config: DeciderConfig,
    last_logged: HashMap<String, Instant>,
}

impl AttendanceDecider<EuclideanMatcher> {
    pub fn new(gallery: Gallery, config: DeciderConfig) -> Self {
        Self::with_matcher(gallery, EuclideanMatcher, config)
    }
}

impl<M: Matcher> AttendanceDecider<M> {
    pub fn with_matcher(gallery: Gallery, matcher: M, config: DeciderConfig) -> Self {
        Self {
            gallery,
            matcher,
            config,
            last_logged: HashMap::new(),
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn config(&self) -> &DeciderConfig {
        &self.config
    }

    /// Assign an identity to the encoding, or `Unknown`.
    pub fn identify(&self, encoding: &Encoding) -> MatchResult {
        self.matcher
            .compare(encoding, &self.gallery, self.config.match_threshold)
    }

    /// True iff the identity has never been logged this session, or the
    /// cooldown has strictly elapsed since its last log.
    pub fn should_log(&self, identity_id: &str, now: Instant) -> bool {
        match self.last_logged.get(identity_id) {
            None => true,
            Some(&last) => elapsed_exceeds(last, now, self.config.cooldown),
        }
    }

    /// Mark the identity as logged. Call only after the event was persisted.
    pub fn record_logged(&mut self, identity_id: &str, now: Instant) {
        self.last_logged.insert(identity_id.to_string(), now);
    }

    pub fn last_logged(&self, identity_id: &str) -> Option<Instant> {
        self.last_logged.get(identity_id).copied()
    }

    /// Identify, then gate on cooldown. Does not change any state.
    pub fn decide(&self, encoding: &Encoding, now: Instant) -> Decision {
        match self.identify(encoding) {
            MatchResult::Unknown { nearest_distance } => Decision::Unknown { nearest_distance },
            MatchResult::Matched {
                identity_id,
                display_name,
                distance,
            } => {
                if self.should_log(&identity_id, now) {
                    Decision::Eligible {
                        identity_id,
                        display_name,
                        distance,
                    }
                } else {
                    Decision::WithinCooldown {
                        identity_id,
                        display_name,
                        distance,
                    }
                }
            }
        }
    }
}
