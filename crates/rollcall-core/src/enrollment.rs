//! Enrollment: average several spaced face samples into one stable encoding,
//! refuse duplicates by id and by face, then persist the identity.

use crate::capture::{elapsed_exceeds, CancelToken, CaptureError, Clock, FaceEmbedder, FrameSource};
use crate::gallery::Gallery;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{Encoding, Identity};
use chrono::Duration;
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_ENROLL_SAMPLES: usize = 5;
pub const DEFAULT_SAMPLE_INTERVAL_SECS: i64 = 2;
pub const DEFAULT_ENROLL_TIMEOUT_SECS: i64 = 120;
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid enrollment request: {0}")]
    InvalidRequest(String),
    #[error("identity id already enrolled: {0}")]
    DuplicateId(String),
    #[error("face already enrolled as {identity_id} (distance {distance:.3})")]
    DuplicateFace { identity_id: String, distance: f64 },
    #[error("no face detected before timeout")]
    NoFaceDetected,
    #[error("collected {collected} of {required} samples before timeout")]
    Incomplete { collected: usize, required: usize },
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EnrollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateId(id) => EnrollError::DuplicateId(id),
            other => EnrollError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnrollmentConfig {
    /// Number of samples averaged into the stored encoding.
    pub num_samples: usize,
    /// Minimum spacing between accepted samples. Zero accepts every detection.
    pub sample_interval: Duration,
    /// Give up after this long without an accepted sample.
    pub idle_timeout: Duration,
    /// A gallery face strictly closer than this blocks enrollment.
    pub duplicate_threshold: f64,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            num_samples: DEFAULT_ENROLL_SAMPLES,
            sample_interval: Duration::seconds(DEFAULT_SAMPLE_INTERVAL_SECS),
            idle_timeout: Duration::seconds(DEFAULT_ENROLL_TIMEOUT_SECS),
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollProgress {
    SampleAccepted { collected: usize, required: usize },
    NoFace,
}

/// Accepts spaced samples until enough have been gathered.
pub struct SampleCollector {
    required: usize,
    interval: Duration,
    last_accept: Instant,
    samples: Vec<Encoding>,
}

impl SampleCollector {
    pub fn new(required: usize, interval: Duration, started: Instant) -> Self {
        Self {
            required,
            interval,
            last_accept: started,
            samples: Vec::with_capacity(required),
        }
    }

    /// Offer a detection's encoding. Returns true if it was kept.
    pub fn offer(&mut self, encoding: Encoding, now: Instant) -> bool {
        let too_soon = now.saturating_duration_since(self.last_accept)
            < self.interval.to_std().unwrap_or_default();
        if self.is_complete() || too_soon {
            return false;
        }
        self.samples.push(encoding);
        self.last_accept = now;
        true
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.required
    }

    /// True once more than `timeout` has passed since the last accepted
    /// sample (or since start).
    pub fn idle_longer_than(&self, timeout: Duration, now: Instant) -> bool {
        elapsed_exceeds(self.last_accept, now, timeout)
    }

    pub fn mean(&self) -> Option<Encoding> {
        Encoding::mean(&self.samples)
    }

    fn shortfall(&self) -> EnrollError {
        match self.samples.len() {
            0 => EnrollError::NoFaceDetected,
            collected => EnrollError::Incomplete {
                collected,
                required: self.required,
            },
        }
    }
}

/// Runs one enrollment against borrowed collaborators.
pub struct Enroller<'a, St: AttendanceStore + ?Sized, C: Clock + ?Sized> {
    pub store: &'a St,
    pub gallery: &'a Gallery,
    pub clock: &'a C,
    pub config: EnrollmentConfig,
    pub cancel: CancelToken,
}

impl<'a, St: AttendanceStore + ?Sized, C: Clock + ?Sized> Enroller<'a, St, C> {
    /// Validate, capture, average, check for a duplicate face, persist.
    ///
    /// Nothing is written unless every check passes.
    pub fn enroll<S, E>(
        &self,
        request: &EnrollmentRequest,
        source: &mut S,
        embedder: &mut E,
        mut on_progress: impl FnMut(EnrollProgress),
    ) -> Result<Identity, EnrollError>
    where
        S: FrameSource,
        E: FaceEmbedder<Frame = S::Frame>,
    {
        let id = request.id.trim();
        let display_name = request.display_name.trim();
        if id.is_empty() || display_name.is_empty() {
            return Err(EnrollError::InvalidRequest(
                "id and display name must not be empty".into(),
            ));
        }
        if self.config.num_samples == 0 {
            return Err(EnrollError::InvalidRequest("sample count must be positive".into()));
        }
        if self.store.identity_exists(id)? {
            return Err(EnrollError::DuplicateId(id.to_string()));
        }

        tracing::info!(
            id,
            samples = self.config.num_samples,
            "enroll: capturing samples"
        );

        let mut collector = SampleCollector::new(
            self.config.num_samples,
            self.config.sample_interval,
            self.clock.instant(),
        );

        while !collector.is_complete() {
            if self.cancel.is_cancelled() {
                return Err(EnrollError::Cancelled);
            }
            if collector.idle_longer_than(self.config.idle_timeout, self.clock.instant()) {
                tracing::warn!(id, collected = collector.collected(), "enroll: timed out");
                return Err(collector.shortfall());
            }

            let Some(frame) = source.next_frame()? else {
                tracing::warn!(id, collected = collector.collected(), "enroll: frame stream ended");
                return Err(collector.shortfall());
            };

            let detections = match embedder.detect_and_embed(&frame) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(error = %err, "enroll: embedding failed; skipping frame");
                    continue;
                }
            };

            let Some(face) = detections.into_iter().next() else {
                on_progress(EnrollProgress::NoFace);
                continue;
            };

            if collector.offer(face.encoding, self.clock.instant()) {
                tracing::debug!(collected = collector.collected(), "enroll: sample accepted");
                on_progress(EnrollProgress::SampleAccepted {
                    collected: collector.collected(),
                    required: self.config.num_samples,
                });
            }
        }

        let encoding = collector.mean().ok_or(EnrollError::NoFaceDetected)?;

        if let Some((existing, distance)) = self
            .gallery
            .contains_near_duplicate(&encoding, self.config.duplicate_threshold)
        {
            tracing::warn!(id, existing = %existing.id, distance, "enroll: duplicate face");
            return Err(EnrollError::DuplicateFace {
                identity_id: existing.id.clone(),
                distance,
            });
        }

        let identity = Identity {
            id: id.to_string(),
            display_name: display_name.to_string(),
            encoding,
        };
        self.store.insert_identity(&identity)?;

        tracing::info!(id, name = display_name, "enroll: identity stored");
        Ok(identity)
    }
}
