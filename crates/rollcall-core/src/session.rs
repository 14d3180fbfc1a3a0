//! Recognition session: frame → detect/embed → match → cooldown → persist.
//!
//! [`run_session`] is the synchronous loop. [`spawn_session`] runs it on a
//! dedicated OS thread and forwards its events over a channel so the
//! presentation side never blocks on capture.

use crate::capture::{elapsed_exceeds, CancelToken, CaptureError, Clock, FaceEmbedder, FrameSource};
use crate::decider::{AttendanceDecider, Decision};
use crate::gallery::Matcher;
use crate::store::AttendanceStore;
use crate::types::{AttendanceEvent, BoundingBox};
use chrono::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 120;
const UNKNOWN_LABEL: &str = "Unknown";
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture failure: {0}")]
    CaptureFailure(#[from] CaptureError),
    #[error("session thread exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// End the session when this long passes without any detected face.
    pub idle_timeout: Duration,
    /// End the session right after the first persisted event.
    pub stop_after_first_log: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::seconds(DEFAULT_IDLE_TIMEOUT_SECS),
            stop_after_first_log: false,
        }
    }
}

/// How a detection should be drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Unknown,
    WithinCooldown,
    Logged,
    /// Matched and eligible, but the attendance write failed.
    LogFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderUpdate {
    pub bbox: BoundingBox,
    pub label: String,
    pub state: MatchState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Detection(RenderUpdate),
    Logged(AttendanceEvent),
    LogFailed { identity_id: String, reason: String },
    EmbedFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Single-shot mode: the first event was persisted.
    Logged {
        identity_id: String,
        display_name: String,
    },
    Timeout,
    Stopped,
    EndOfStream,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub frames: u64,
    pub logged: u64,
    pub failed_writes: u64,
    pub outcome: SessionOutcome,
}

/// Borrowed collaborators for one synchronous session run.
pub struct SessionContext<'a, St: AttendanceStore + ?Sized, C: Clock + ?Sized> {
    pub store: &'a St,
    pub clock: &'a C,
    pub cancel: &'a CancelToken,
    pub config: SessionConfig,
}

/// Process frames until stopped, timed out, the stream ends, or capture fails.
pub fn run_session<S, E, M, St, C>(
    ctx: SessionContext<'_, St, C>,
    decider: &mut AttendanceDecider<M>,
    source: &mut S,
    embedder: &mut E,
    mut emit: impl FnMut(SessionEvent),
) -> Result<SessionReport, SessionError>
where
    S: FrameSource,
    E: FaceEmbedder<Frame = S::Frame>,
    M: Matcher,
    St: AttendanceStore + ?Sized,
    C: Clock + ?Sized,
{
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("session", id = %session_id);
    let _enter = span.enter();

    if decider.gallery().is_empty() {
        tracing::warn!("no enrolled identities; every face will be unknown");
    }
    tracing::info!(
        enrolled = decider.gallery().len(),
        threshold = decider.config().match_threshold,
        cooldown_secs = decider.config().cooldown.num_seconds(),
        "session started"
    );

    let mut report = SessionReport {
        session_id,
        frames: 0,
        logged: 0,
        failed_writes: 0,
        outcome: SessionOutcome::Stopped,
    };
    let mut last_activity = ctx.clock.instant();

    loop {
        if ctx.cancel.is_cancelled() {
            report.outcome = SessionOutcome::Stopped;
            break;
        }
        if elapsed_exceeds(last_activity, ctx.clock.instant(), ctx.config.idle_timeout) {
            tracing::info!("no face detected within idle timeout");
            report.outcome = SessionOutcome::Timeout;
            break;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                report.outcome = SessionOutcome::EndOfStream;
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, frames = report.frames, "frame source failed");
                return Err(SessionError::CaptureFailure(err));
            }
        };
        report.frames += 1;

        let detections = match embedder.detect_and_embed(&frame) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed; skipping frame");
                emit(SessionEvent::EmbedFailed {
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let now = ctx.clock.instant();
        if !detections.is_empty() {
            last_activity = now;
        }
        tracing::debug!(faces = detections.len(), "frame processed");

        for detection in detections {
            let decision = decider.decide(&detection.encoding, now);
            let (label, state) = match decision {
                Decision::Unknown { nearest_distance } => {
                    tracing::debug!(?nearest_distance, "unknown face");
                    (UNKNOWN_LABEL.to_string(), MatchState::Unknown)
                }
                Decision::WithinCooldown { display_name, .. } => {
                    (display_name, MatchState::WithinCooldown)
                }
                Decision::Eligible {
                    identity_id,
                    display_name,
                    distance,
                } => match ctx.store.append_attendance(&identity_id, ctx.clock.now()) {
                    Ok(event) => {
                        decider.record_logged(&identity_id, now);
                        report.logged += 1;
                        tracing::info!(identity = %identity_id, distance, "attendance logged");
                        emit(SessionEvent::Logged(event));
                        emit(SessionEvent::Detection(RenderUpdate {
                            bbox: detection.bbox,
                            label: display_name.clone(),
                            state: MatchState::Logged,
                        }));
                        if ctx.config.stop_after_first_log {
                            report.outcome = SessionOutcome::Logged {
                                identity_id,
                                display_name,
                            };
                            tracing::info!(frames = report.frames, "session finished after first log");
                            return Ok(report);
                        }
                        continue;
                    }
                    Err(err) => {
                        // Not recorded: the next sighting may try again.
                        report.failed_writes += 1;
                        tracing::warn!(identity = %identity_id, error = %err, "attendance write failed");
                        emit(SessionEvent::LogFailed {
                            identity_id,
                            reason: err.to_string(),
                        });
                        (display_name, MatchState::LogFailed)
                    }
                },
            };
            emit(SessionEvent::Detection(RenderUpdate {
                bbox: detection.bbox,
                label,
                state,
            }));
        }
    }

    tracing::info!(
        frames = report.frames,
        logged = report.logged,
        failed_writes = report.failed_writes,
        outcome = ?report.outcome,
        "session finished"
    );
    Ok(report)
}

/// Everything a background session needs, moved onto its thread.
pub struct SessionParts<S, E, M, St, C>
where
    M: Matcher,
{
    pub source: S,
    pub embedder: E,
    pub decider: AttendanceDecider<M>,
    pub store: St,
    pub clock: C,
    pub config: SessionConfig,
}

/// Handle to a session running on its own thread.
pub struct SessionHandle {
    cancel: CancelToken,
    events: mpsc::Receiver<SessionEvent>,
    done: oneshot::Receiver<Result<SessionReport, SessionError>>,
}

impl SessionHandle {
    /// Ask the session to stop before its next frame.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the session thread has finished.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the final report.
    pub async fn finish(self) -> Result<SessionReport, SessionError> {
        self.done.await.map_err(|_| SessionError::ChannelClosed)?
    }
}

/// Spawn a recognition session on a dedicated OS thread.
pub fn spawn_session<S, E, M, St, C>(parts: SessionParts<S, E, M, St, C>) -> SessionHandle
where
    S: FrameSource + Send + 'static,
    E: FaceEmbedder<Frame = S::Frame> + Send + 'static,
    M: Matcher + Send + 'static,
    St: AttendanceStore + Send + 'static,
    C: Clock + Send + 'static,
{
    let cancel = CancelToken::new();
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    let thread_cancel = cancel.clone();

    std::thread::Builder::new()
        .name("rollcall-session".into())
        .spawn(move || {
            let SessionParts {
                mut source,
                mut embedder,
                mut decider,
                store,
                clock,
                config,
            } = parts;
            let ctx = SessionContext {
                store: &store,
                clock: &clock,
                cancel: &thread_cancel,
                config,
            };
            let result = run_session(ctx, &mut decider, &mut source, &mut embedder, |event| {
                // Receiver gone means nobody is presenting; keep deciding anyway.
                let _ = event_tx.blocking_send(event);
            });
            let _ = done_tx.send(result);
        })
        .expect("failed to spawn session thread");

    SessionHandle {
        cancel,
        events: event_rx,
        done: done_rx,
    }
}
