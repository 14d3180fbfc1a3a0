//! Collaborator seams for frame acquisition, face embedding, time and cancellation.

use crate::types::Detection;
use chrono::{Duration, Local, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame source failed: {0}")]
    SourceFailed(String),
}

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding failed: {0}")]
    Failed(String),
}

/// Produces frames until the stream ends (`Ok(None)`).
pub trait FrameSource {
    type Frame;

    fn next_frame(&mut self) -> Result<Option<Self::Frame>, CaptureError>;
}

/// Finds faces in a frame and computes one encoding per face.
pub trait FaceEmbedder {
    type Frame;

    fn detect_and_embed(&mut self, frame: &Self::Frame) -> Result<Vec<Detection>, EmbedError>;
}

/// Time source.
///
/// `now` is local wall-clock time and is only used for stored timestamps.
/// Cooldowns, idle timeouts and sample spacing are measured on `instant`,
/// which never jumps when the wall clock is adjusted.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
    fn instant(&self) -> Instant;
}

/// True once strictly more than `window` has passed from `since` to `now`.
///
/// A negative window counts as zero.
pub fn elapsed_exceeds(since: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(since) > window.to_std().unwrap_or_default()
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

struct ManualState {
    wall: NaiveDateTime,
    mono: Instant,
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                wall: start,
                mono: Instant::now(),
            })),
        }
    }

    /// Move both readings forward. Negative durations are ignored.
    pub fn advance(&self, by: Duration) {
        let Ok(step) = by.to_std() else { return };
        if let Ok(mut state) = self.state.lock() {
            state.wall += by;
            state.mono += step;
        }
    }

    /// Reset the wall clock only, as a DST change or NTP step would.
    pub fn set(&self, to: NaiveDateTime) {
        if let Ok(mut state) = self.state.lock() {
            state.wall = to;
        }
    }

    fn read<T>(&self, f: impl FnOnce(&ManualState) -> T) -> T {
        match self.state.lock() {
            Ok(state) => f(&state),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.read(|s| s.wall)
    }

    fn instant(&self) -> Instant {
        self.read(|s| s.mono)
    }
}

/// Cooperative stop flag, checked once per frame.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_manual_clock_advances() {
        let start = NaiveDateTime::parse_from_str("2025-07-20 09:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let clock = ManualClock::new(start);
        let before = clock.instant();
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
        assert_eq!(clock.instant() - before, std::time::Duration::from_secs(90));
    }

    #[test]
    fn test_wall_jump_leaves_monotonic_alone() {
        let start = NaiveDateTime::parse_from_str("2025-03-30 01:58:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let clock = ManualClock::new(start);
        let before = clock.instant();
        clock.set(start + Duration::hours(1));
        assert_eq!(clock.now(), start + Duration::hours(1));
        assert_eq!(clock.instant(), before);
    }

    #[test]
    fn test_elapsed_exceeds_is_strict() {
        let t = Instant::now();
        let window = Duration::seconds(300);
        assert!(!elapsed_exceeds(t, t + std::time::Duration::from_secs(300), window));
        assert!(elapsed_exceeds(t, t + std::time::Duration::from_secs(301), window));
        // Readings out of order never count as elapsed
        assert!(!elapsed_exceeds(t + std::time::Duration::from_secs(10), t, window));
        assert!(elapsed_exceeds(t, t + std::time::Duration::from_secs(1), Duration::seconds(-5)));
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
