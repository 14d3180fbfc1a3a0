//! rollcall-core — Face-matching and attendance decision engine.
//!
//! Matches externally computed face encodings against a gallery of enrolled
//! identities and decides when a sighting becomes an attendance event.

pub mod capture;
pub mod decider;
pub mod enrollment;
pub mod gallery;
pub mod session;
pub mod store;
pub mod types;

pub use capture::{CancelToken, Clock, FaceEmbedder, FrameSource, SystemClock};
pub use decider::{AttendanceDecider, DeciderConfig, Decision};
pub use enrollment::{EnrollError, Enroller, EnrollmentConfig, EnrollmentRequest, EnrollProgress};
pub use gallery::{EuclideanMatcher, Gallery, MatchResult, Matcher};
pub use session::{
    spawn_session, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionOutcome,
    SessionParts, SessionReport,
};
pub use store::{AttendanceStore, DateRange, MemoryStore, StoreError};
pub use types::{
    AttendanceEvent, AttendanceRecord, AttendanceStatus, BoundingBox, Detection, Encoding,
    Identity, ENCODING_DIM,
};
