use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::config::{
    DEFAULT_CONFIDENCE_CUTOFF, DEFAULT_CYCLE_TICKS, DEFAULT_DEBOUNCE, DEFAULT_INFO_TICKS,
    DEFAULT_MATCH_TOLERANCE, DEFAULT_WINDOW_SIZE,
};
use rollcall_core::{AttendanceConfig, SystemClock};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// JSON-lines observation feed written by the inference sidecar (`-` = stdin).
    pub feed: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Tunables handed to the attendance session.
    pub attendance: AttendanceConfig,
    /// Whether stored timestamps are UTC (default) or host local time.
    pub clock_utc: bool,
    /// SQLite busy timeout: the budget for one store call.
    pub store_timeout: Duration,
    /// How long a D-Bus handler waits for the engine thread to answer.
    pub request_timeout: Duration,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let window_size = env_usize("ROLLCALL_WINDOW_SIZE", DEFAULT_WINDOW_SIZE);

        Self {
            feed: std::env::var("ROLLCALL_FEED").unwrap_or_else(|_| "-".to_string()),
            db_path,
            attendance: AttendanceConfig {
                confidence_cutoff: env_f32("ROLLCALL_CONFIDENCE_CUTOFF", DEFAULT_CONFIDENCE_CUTOFF),
                window_size,
                stability_threshold: env_usize(
                    "ROLLCALL_STABILITY_THRESHOLD",
                    default_threshold(window_size),
                ),
                debounce: Duration::from_secs(env_u64(
                    "ROLLCALL_DEBOUNCE_SECS",
                    DEFAULT_DEBOUNCE.as_secs(),
                )),
                info_ticks: env_u32("ROLLCALL_INFO_TICKS", DEFAULT_INFO_TICKS),
                cycle_ticks: env_u32("ROLLCALL_CYCLE_TICKS", DEFAULT_CYCLE_TICKS),
                match_tolerance: env_f32("ROLLCALL_MATCH_TOLERANCE", DEFAULT_MATCH_TOLERANCE),
            },
            clock_utc: std::env::var("ROLLCALL_CLOCK")
                .map(|v| !v.eq_ignore_ascii_case("local"))
                .unwrap_or(true),
            store_timeout: Duration::from_millis(env_u64("ROLLCALL_STORE_TIMEOUT_MS", 2000)),
            request_timeout: Duration::from_secs(env_u64("ROLLCALL_REQUEST_TIMEOUT_SECS", 5)),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS").is_ok(),
        }
    }

    pub fn clock(&self) -> SystemClock {
        if self.clock_utc {
            SystemClock::utc()
        } else {
            SystemClock::local()
        }
    }
}

/// One spoof frame is tolerated per window, but at least one live frame is
/// always required.
fn default_threshold(window_size: usize) -> usize {
    window_size.saturating_sub(1).max(1)
}

fn env_f32(key: &str, default: f32) -> f32 {
    parse_or(std::env::var(key).ok().as_deref(), default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    parse_or(std::env::var(key).ok().as_deref(), default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    parse_or(std::env::var(key).ok().as_deref(), default)
}

fn env_usize(key: &str, default: usize) -> usize {
    parse_or(std::env::var(key).ok().as_deref(), default)
}

/// Parse `value`, falling back to `default` when absent or malformed.
fn parse_or<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
