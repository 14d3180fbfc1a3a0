use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use rollcall_core::session::{MatchState, SessionOutcome};
use rollcall_core::store::StoreError;
use rollcall_core::{
    spawn_session, AttendanceDecider, AttendanceEvent, AttendanceStore, CancelToken, Clock, DateRange,
    EnrollProgress, Enroller, EnrollmentRequest, Gallery, SessionEvent, SessionParts,
    SystemClock,
};
use rollcall_store::SqliteStore;
use std::path::PathBuf;
use std::time::Duration;

mod config;
mod replay;

use config::Config;
use replay::{PrecomputedEmbedder, ReplaySource};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance log")]
struct Cli {
    /// TOML configuration file (overrides ROLLCALL_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a stream of detections
    Enroll {
        /// Unique identity id (e.g., "S001")
        id: String,
        /// Display name
        name: String,
        /// JSON-lines detection replay, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        /// Delay between replayed frames, in milliseconds
        #[arg(long)]
        pace_ms: Option<u64>,
    },
    /// Match detections against enrolled identities and log attendance
    Recognize {
        /// JSON-lines detection replay, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        /// Stop after the first attendance event
        #[arg(long)]
        once: bool,
        /// Delay between replayed frames, in milliseconds
        #[arg(long)]
        pace_ms: Option<u64>,
    },
    /// Record attendance for an identity by hand
    Mark {
        id: String,
    },
    /// List enrolled identities
    List,
    /// Remove an identity and its attendance history
    Remove {
        id: String,
    },
    /// Print attendance records, most recent first
    Report {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show configuration and database status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            input,
            pace_ms,
        } => enroll(&config, id, name, input, pace_ms).await,
        Commands::Recognize {
            input,
            once,
            pace_ms,
        } => recognize(&config, input, once, pace_ms).await,
        Commands::Mark { id } => {
            let store = open_store(&config)?;
            let event = mark(&store, &id, SystemClock.now())?;
            println!("Attendance marked for {id} at {}", event.timestamp);
            Ok(())
        }
        Commands::List => {
            let store = open_store(&config)?;
            let identities = store.load_identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!("{}\t{}", identity.id, identity.display_name);
            }
            Ok(())
        }
        Commands::Remove { id } => {
            let store = open_store(&config)?;
            store
                .delete_identity(&id)
                .with_context(|| format!("removing {id}"))?;
            println!("Removed {id} and its attendance records");
            Ok(())
        }
        Commands::Report { from, to, json } => {
            let store = open_store(&config)?;
            let records = store.query_attendance(&DateRange {
                start: from,
                end: to,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance records");
            } else {
                for r in records {
                    println!("{}\t{}\t{}\t{}", r.timestamp, r.identity_id, r.display_name, r.status);
                }
            }
            Ok(())
        }
        Commands::Status => {
            let store = open_store(&config)?;
            let enrolled = store.load_identities()?.len();
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "database": config.db_path.display().to_string(),
                    "enrolled": enrolled,
                    "config": config,
                })
            );
            Ok(())
        }
    }
}

/// Manual attendance: no cooldown, but the identity must exist.
fn mark(
    store: &dyn AttendanceStore,
    id: &str,
    now: NaiveDateTime,
) -> Result<AttendanceEvent, StoreError> {
    if !store.identity_exists(id)? {
        return Err(StoreError::NotFound(id.to_string()));
    }
    store.append_attendance(id, now)
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping");
            token.cancel();
        }
    });
}

async fn enroll(
    config: &Config,
    id: String,
    name: String,
    input: PathBuf,
    pace_ms: Option<u64>,
) -> Result<()> {
    let store = open_store(config)?;
    let gallery = Gallery::load(&store)?;
    let mut source = ReplaySource::open(&input, pace_ms.map(Duration::from_millis))?;
    let enroll_config = config.enrollment()?;
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    println!("Enrolling {name} ({id}): collecting {} samples", enroll_config.num_samples);

    let identity = tokio::task::spawn_blocking(move || {
        let enroller = Enroller {
            store: &store,
            gallery: &gallery,
            clock: &SystemClock,
            config: enroll_config,
            cancel,
        };
        let request = EnrollmentRequest {
            id,
            display_name: name,
        };
        enroller.enroll(&request, &mut source, &mut PrecomputedEmbedder, |progress| {
            if let EnrollProgress::SampleAccepted {
                collected,
                required,
            } = progress
            {
                println!("Sample {collected}/{required} captured");
            }
        })
    })
    .await
    .context("enrollment task panicked")??;

    println!(
        "Enrolled {} ({})",
        identity.display_name, identity.id
    );
    Ok(())
}

async fn recognize(
    config: &Config,
    input: PathBuf,
    once: bool,
    pace_ms: Option<u64>,
) -> Result<()> {
    let decider_config = config.decider()?;
    let session_config = config.session(once)?;
    let store = open_store(config)?;
    let gallery = Gallery::load(&store)?;
    let source = ReplaySource::open(&input, pace_ms.map(Duration::from_millis))?;

    let mut handle = spawn_session(SessionParts {
        source,
        embedder: PrecomputedEmbedder,
        decider: AttendanceDecider::new(gallery, decider_config),
        store,
        clock: SystemClock,
        config: session_config,
    });
    cancel_on_ctrl_c(handle.cancel_token());

    // Events are presented here, on the async side; the session thread only sends.
    while let Some(event) = handle.next_event().await {
        match event {
            SessionEvent::Detection(update) => {
                let state = match update.state {
                    MatchState::Unknown => "unknown",
                    MatchState::WithinCooldown => "already logged",
                    MatchState::Logged => "logged",
                    MatchState::LogFailed => "log failed",
                };
                tracing::debug!(label = %update.label, state, bbox = ?update.bbox, "detection");
            }
            SessionEvent::Logged(event) => {
                println!("Present: {} at {}", event.identity_id, event.timestamp);
            }
            SessionEvent::LogFailed {
                identity_id,
                reason,
            } => {
                eprintln!("Could not log attendance for {identity_id}: {reason}");
            }
            SessionEvent::EmbedFailed { reason } => {
                eprintln!("Skipped frame: {reason}");
            }
        }
    }

    let report = handle.finish().await?;
    match &report.outcome {
        SessionOutcome::Logged {
            identity_id,
            display_name,
        } => println!("Attendance marked for {display_name} ({identity_id})"),
        SessionOutcome::Timeout => println!("Timeout: no face detected"),
        SessionOutcome::Stopped => println!("Stopped"),
        SessionOutcome::EndOfStream => println!("Input finished"),
    }
    println!(
        "{} frames, {} logged, {} failed writes",
        report.frames, report.logged, report.failed_writes
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Encoding, Identity, ENCODING_DIM};

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2025-07-20 09:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_mark_unknown_id_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = mark(&store, "S404", now()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref id) if id == "S404"));
        assert!(store.query_attendance(&DateRange::all()).unwrap().is_empty());
    }

    #[test]
    fn test_mark_ignores_cooldown() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_identity(&Identity {
                id: "S001".into(),
                display_name: "Ana".into(),
                encoding: Encoding::new(vec![0.0; ENCODING_DIM]).unwrap(),
            })
            .unwrap();
        mark(&store, "S001", now()).unwrap();
        let event = mark(&store, "S001", now()).unwrap();
        assert_eq!(event.identity_id, "S001");
        assert_eq!(store.query_attendance(&DateRange::all()).unwrap().len(), 2);
    }
}
