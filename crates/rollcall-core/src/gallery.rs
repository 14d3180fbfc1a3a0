//! In-memory gallery of enrolled identities and nearest-neighbour matching.

use crate::store::{AttendanceStore, StoreError};
use crate::types::{Encoding, Identity};

/// Result of matching a probe encoding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        identity_id: String,
        display_name: String,
        distance: f64,
    },
    Unknown {
        /// Distance to the closest enrolled encoding, if the gallery is non-empty.
        nearest_distance: Option<f64>,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

/// Enrolled identities, loaded once per process run. Read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    /// Read every enrolled identity from the store. An empty store is valid.
    pub fn load(store: &dyn AttendanceStore) -> Result<Self, StoreError> {
        let identities = store.load_identities()?;
        tracing::info!(count = identities.len(), "gallery loaded");
        Ok(Self { identities })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Closest enrolled identity and its distance. `None` when empty.
    ///
    /// Linear scan; on equal distances the earlier identity wins.
    pub fn nearest(&self, encoding: &Encoding) -> Option<(&Identity, f64)> {
        let mut best: Option<(&Identity, f64)> = None;
        for identity in &self.identities {
            let distance = encoding.euclidean_distance(&identity.encoding);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((identity, distance)),
            }
        }
        best
    }

    /// Closest identity strictly below `threshold`, used to block enrolling
    /// the same face twice under different ids.
    pub fn contains_near_duplicate(
        &self,
        encoding: &Encoding,
        threshold: f64,
    ) -> Option<(&Identity, f64)> {
        self.nearest(encoding)
            .filter(|&(_, distance)| distance < threshold)
    }
}

/// Strategy for comparing a probe encoding against the gallery.
pub trait Matcher {
    fn compare(&self, probe: &Encoding, gallery: &Gallery, threshold: f64) -> MatchResult;
}

/// Minimum-Euclidean-distance matcher. Accepts when `distance <= threshold`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Encoding, gallery: &Gallery, threshold: f64) -> MatchResult {
        match gallery.nearest(probe) {
            Some((identity, distance)) if distance <= threshold => MatchResult::Matched {
                identity_id: identity.id.clone(),
                display_name: identity.display_name.clone(),
                distance,
            },
            Some((_, distance)) => MatchResult::Unknown {
                nearest_distance: Some(distance),
            },
            None => MatchResult::Unknown {
                nearest_distance: None,
            },
        }
    }
}
