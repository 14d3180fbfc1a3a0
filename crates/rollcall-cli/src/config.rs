use anyhow::{bail, Context, Result};
use rollcall_core::decider::{DEFAULT_COOLDOWN_SECS, DEFAULT_MATCH_THRESHOLD};
use rollcall_core::enrollment::{
    DEFAULT_DUPLICATE_THRESHOLD, DEFAULT_ENROLL_SAMPLES, DEFAULT_ENROLL_TIMEOUT_SECS,
    DEFAULT_SAMPLE_INTERVAL_SECS,
};
use rollcall_core::session::DEFAULT_IDLE_TIMEOUT_SECS;
use rollcall_core::{DeciderConfig, EnrollmentConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration: TOML file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f64,
    /// Enrollment is refused if an enrolled face is closer than this.
    pub duplicate_threshold: f64,
    /// Seconds before the same person can be logged again.
    pub cooldown_secs: i64,
    /// Seconds without any detected face before recognition gives up.
    pub idle_timeout_secs: i64,
    /// Samples averaged into one enrollment encoding.
    pub enroll_samples: usize,
    /// Minimum seconds between enrollment samples.
    pub enroll_interval_secs: i64,
    /// Seconds without an accepted sample before enrollment gives up.
    pub enroll_timeout_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            enroll_samples: DEFAULT_ENROLL_SAMPLES,
            enroll_interval_secs: DEFAULT_SAMPLE_INTERVAL_SECS,
            enroll_timeout_secs: DEFAULT_ENROLL_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load from `path` (or `ROLLCALL_CONFIG`) if given, then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&var, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&var, "ROLLCALL_DUPLICATE_THRESHOLD", &mut self.duplicate_threshold);
        override_parsed(&var, "ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        override_parsed(&var, "ROLLCALL_IDLE_TIMEOUT_SECS", &mut self.idle_timeout_secs);
        override_parsed(&var, "ROLLCALL_ENROLL_SAMPLES", &mut self.enroll_samples);
        override_parsed(&var, "ROLLCALL_ENROLL_INTERVAL_SECS", &mut self.enroll_interval_secs);
        override_parsed(&var, "ROLLCALL_ENROLL_TIMEOUT_SECS", &mut self.enroll_timeout_secs);
    }

    /// Reject values the core would misbehave on.
    ///
    /// Thresholds must be finite and positive. Cooldown and timeouts must be
    /// positive, the sample interval non-negative, and every duration must fit
    /// a `chrono::Duration`.
    pub fn validate(&self) -> Result<()> {
        positive_threshold("match_threshold", self.match_threshold)?;
        positive_threshold("duplicate_threshold", self.duplicate_threshold)?;
        for (key, secs) in [
            ("cooldown_secs", self.cooldown_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("enroll_timeout_secs", self.enroll_timeout_secs),
        ] {
            if secs <= 0 {
                bail!("{key} must be positive, got {secs}");
            }
            seconds(key, secs)?;
        }
        if self.enroll_interval_secs < 0 {
            bail!("enroll_interval_secs must not be negative, got {}", self.enroll_interval_secs);
        }
        seconds("enroll_interval_secs", self.enroll_interval_secs)?;
        if self.enroll_samples == 0 {
            bail!("enroll_samples must be positive");
        }
        Ok(())
    }

    pub fn decider(&self) -> Result<DeciderConfig> {
        Ok(DeciderConfig {
            match_threshold: self.match_threshold,
            cooldown: seconds("cooldown_secs", self.cooldown_secs)?,
        })
    }

    pub fn session(&self, stop_after_first_log: bool) -> Result<SessionConfig> {
        Ok(SessionConfig {
            idle_timeout: seconds("idle_timeout_secs", self.idle_timeout_secs)?,
            stop_after_first_log,
        })
    }

    pub fn enrollment(&self) -> Result<EnrollmentConfig> {
        Ok(EnrollmentConfig {
            num_samples: self.enroll_samples,
            sample_interval: seconds("enroll_interval_secs", self.enroll_interval_secs)?,
            idle_timeout: seconds("enroll_timeout_secs", self.enroll_timeout_secs)?,
            duplicate_threshold: self.duplicate_threshold,
        })
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("attendance.db")
}

fn seconds(key: &str, secs: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_seconds(secs).with_context(|| format!("{key} = {secs} is out of range"))
}

fn positive_threshold(key: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{key} must be a positive number, got {value}");
    }
    Ok(())
}

fn override_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    match var(key).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => *target = value,
        Some(Err(_)) => tracing::warn!(key, "ignoring unparseable environment override"),
        None => {}
    }
}
