use std::path::PathBuf;
use std::time::Duration;

use passgate_core::{LoopConfig, SessionConfig, DEFAULT_ACCEPT_THRESHOLD};

const DEFAULT_PASS_TYPES: &str = "Bathroom,Nurse,Locker,Office";

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Directory of enrolled `first_last.jpg` photos and their descriptor sidecars.
    pub profile_dir: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub accept_threshold: f32,
    /// How long a granted pass is shown before returning to selection.
    pub grant_dwell: Duration,
    /// How long a finished session waits for the grant to reach the audit sink.
    pub notify_timeout: Duration,
    /// Pause between detection cycles.
    pub frame_interval: Duration,
    /// Per-cycle extractor timeout; `None` waits indefinitely.
    pub cycle_timeout: Option<Duration>,
    /// Pass types offered for selection.
    pub pass_types: Vec<String>,
    /// JSON-lines file that granted passes are appended to.
    pub audit_log: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `PASSGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("passgate");

        let profile_dir = std::env::var("PASSGATE_PROFILE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces"));

        let cycle_timeout = match env_u64("PASSGATE_CYCLE_TIMEOUT_MS", 5000) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Self {
            profile_dir,
            accept_threshold: env_f32("PASSGATE_ACCEPT_THRESHOLD", DEFAULT_ACCEPT_THRESHOLD),
            grant_dwell: Duration::from_millis(env_u64("PASSGATE_GRANT_DWELL_MS", 3000)),
            notify_timeout: Duration::from_millis(env_u64("PASSGATE_NOTIFY_TIMEOUT_MS", 2000)),
            frame_interval: Duration::from_millis(env_u64("PASSGATE_FRAME_INTERVAL_MS", 16)),
            cycle_timeout,
            pass_types: parse_pass_types(
                &std::env::var("PASSGATE_PASS_TYPES")
                    .unwrap_or_else(|_| DEFAULT_PASS_TYPES.to_string()),
            ),
            audit_log: std::env::var("PASSGATE_AUDIT_LOG")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            detection: LoopConfig {
                accept_threshold: self.accept_threshold,
                frame_interval: self.frame_interval,
                cycle_timeout: self.cycle_timeout,
            },
            grant_dwell: self.grant_dwell,
            notify_timeout: self.notify_timeout,
        }
    }

    /// Catalogue entry matching `requested`, ignoring case.
    pub fn find_pass_type(&self, requested: &str) -> Option<&str> {
        self.pass_types
            .iter()
            .find(|t| t.eq_ignore_ascii_case(requested.trim()))
            .map(String::as_str)
    }
}

fn parse_pass_types(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
