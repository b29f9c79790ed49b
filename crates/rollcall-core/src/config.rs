use std::time::Duration;
use thiserror::Error;

/// Default detector confidence below which a detection is ignored.
pub const DEFAULT_CONFIDENCE_CUTOFF: f32 = 0.6;
/// Default liveness window length (frames' worth of face samples).
pub const DEFAULT_WINDOW_SIZE: usize = 5;
/// Default minimum interval between two accepted attendance writes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);
/// Default last tick of the info phase (K1).
pub const DEFAULT_INFO_TICKS: u32 = 40;
/// Default tick at which the display cycle resets (K2).
pub const DEFAULT_CYCLE_TICKS: u32 = 70;
/// Default maximum embedding distance for a positive match.
pub const DEFAULT_MATCH_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("liveness window size must be at least 1")]
    EmptyWindow,
    #[error("stability threshold {threshold} must be between 1 and the window size {window}")]
    Threshold { threshold: usize, window: usize },
    #[error("info phase ({info} ticks) must be non-empty and shorter than the cycle ({cycle} ticks)")]
    Phases { info: u32, cycle: u32 },
    #[error("confidence cutoff {0} must be within [0, 1]")]
    Cutoff(f32),
    #[error("match tolerance {0} must be finite and positive")]
    Tolerance(f32),
}

/// Tunables of the attendance pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceConfig {
    /// Detections at or below this confidence are not folded into the window.
    pub confidence_cutoff: f32,
    /// Number of most recent face samples the liveness vote considers (N).
    pub window_size: usize,
    /// Number of `Live` samples required for a stable decision (default N-1).
    pub stability_threshold: usize,
    /// Minimum time between two accepted attendance writes for one student.
    pub debounce: Duration,
    /// Ticks 1..=info_ticks show the student's record (K1).
    pub info_ticks: u32,
    /// The cycle resets when the counter reaches this value (K2).
    pub cycle_ticks: u32,
    /// Embedding distance at or below which the matcher accepts a face.
    pub match_tolerance: f32,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            confidence_cutoff: DEFAULT_CONFIDENCE_CUTOFF,
            window_size: DEFAULT_WINDOW_SIZE,
            stability_threshold: DEFAULT_WINDOW_SIZE - 1,
            debounce: DEFAULT_DEBOUNCE,
            info_ticks: DEFAULT_INFO_TICKS,
            cycle_ticks: DEFAULT_CYCLE_TICKS,
            match_tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

impl AttendanceConfig {
    /// Check the cross-field constraints. Call once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        if self.stability_threshold == 0 || self.stability_threshold > self.window_size {
            return Err(ConfigError::Threshold {
                threshold: self.stability_threshold,
                window: self.window_size,
            });
        }
        if self.info_ticks == 0 || self.info_ticks >= self.cycle_ticks {
            return Err(ConfigError::Phases {
                info: self.info_ticks,
                cycle: self.cycle_ticks,
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_cutoff) {
            return Err(ConfigError::Cutoff(self.confidence_cutoff));
        }
        if !self.match_tolerance.is_finite() || self.match_tolerance <= 0.0 {
            return Err(ConfigError::Tolerance(self.match_tolerance));
        }
        Ok(())
    }
}
