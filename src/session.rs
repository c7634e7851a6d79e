//! Session management: identity, directories, and lifecycle
//!
//! A session is identified by a deterministic hash of the job configuration
//! (which never contains credentials). The same config always produces the
//! same session id, which is what makes resumption automatic: a rerun of an
//! unchanged job lands in the same directory and picks up its state store.

use crate::config::JobConfig;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Environment variable overriding the base directory
pub const HOME_VAR: &str = "SATFETCH_HOME";

/// Jobs whose end time falls within this window of now are considered live
pub fn default_live_horizon() -> Duration {
    Duration::hours(3)
}

fn invalid_dirname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("static regex"))
}

/// Replace characters invalid in directory names with underscores
pub(crate) fn sanitize_dirname(name: &str) -> String {
    invalid_dirname_pattern().replace_all(name, "_").to_string()
}

fn default_base_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_VAR)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    std::env::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".satfetch")
}

/// Deterministic identity and on-disk layout for one job.
///
/// Owns `<base>/sessions/<id>/` (state store, log, frozen config); download
/// artifacts are rooted at `<base>/downloads/<collection-sanitized>/`.
pub struct Session {
    job: JobConfig,
    session_id: String,
    session_dir: PathBuf,
    download_dir: PathBuf,
    is_new: bool,
    is_live: bool,
}

impl Session {
    /// Build a session for a job using the default base directory
    /// (`~/.satfetch`, overridable via `SATFETCH_HOME`).
    pub fn new(job: &JobConfig) -> Result<Self> {
        Self::with_base_dir(job, default_base_dir())
    }

    /// Build a session with an explicit base directory
    pub fn with_base_dir(job: &JobConfig, base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_live_horizon(job, base_dir, default_live_horizon())
    }

    /// Build a session with an explicit base directory and live horizon
    pub fn with_live_horizon(
        job: &JobConfig,
        base_dir: impl Into<PathBuf>,
        live_horizon: Duration,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        let session_id = compute_id(job)?;
        let session_dir = base_dir.join("sessions").join(&session_id);
        let download_dir = base_dir
            .join("downloads")
            .join(sanitize_dirname(&job.collection));
        let is_new = !session_dir.exists();
        let is_live = check_live(job.filters.dtend, Utc::now(), live_horizon);

        Ok(Self {
            job: job.clone(),
            session_id,
            session_dir,
            download_dir,
            is_new,
            is_live,
        })
    }

    /// Create the directory structure and freeze the job config.
    ///
    /// Idempotent; an existing frozen config is never overwritten.
    pub fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.session_dir)?;
        std::fs::create_dir_all(&self.download_dir)?;

        let config_path = self.config_path();
        if !config_path.exists() {
            let frozen = serde_yaml::to_string(&self.job)?;
            std::fs::write(&config_path, frozen)?;
        }
        Ok(())
    }

    /// The job this session was built for
    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    /// Twelve-hex-character session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The session's own directory
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Root for this job's download artifacts
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// True when the session directory did not exist at construction
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// True when the job's time window may still be accruing new items
    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// Path of the state database inside the session directory
    pub fn state_db_path(&self) -> PathBuf {
        self.session_dir.join("state.db")
    }

    /// Path of the session log file
    pub fn log_path(&self) -> PathBuf {
        self.session_dir.join("session.log")
    }

    /// Path of the frozen job config
    pub fn config_path(&self) -> PathBuf {
        self.session_dir.join("config.yaml")
    }

    /// Session-scoped log sink appending to `session.log`
    pub fn log(&self) -> SessionLog {
        SessionLog {
            path: self.log_path(),
        }
    }
}

/// Hash the canonicalized job config to a 12-hex-character session id.
///
/// Canonical form: JSON with sorted keys, paths and times stringified —
/// exactly what `serde_json::to_value` produces for the config types.
fn compute_id(job: &JobConfig) -> Result<String> {
    let value = serde_json::to_value(job)?;
    let canonical = serde_json::to_string(&value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{digest:x}")[..12].to_string())
}

/// A job is live when it has no end time, or its end time is within the
/// horizon of now.
fn check_live(dtend: Option<DateTime<Utc>>, now: DateTime<Utc>, horizon: Duration) -> bool {
    match dtend {
        None => true,
        Some(end) => end > now - horizon,
    }
}

/// Append-only log file scoped to one session.
///
/// Major lifecycle events land here in addition to the process-wide
/// `tracing` output, giving each session directory a human-readable audit
/// trail.
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// Append one timestamped line; failures are logged and swallowed.
    pub fn append(&self, message: &str) {
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write session log");
        }
    }
}
