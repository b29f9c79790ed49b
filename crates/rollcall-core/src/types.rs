use serde::{Deserialize, Serialize};

/// Per-face verdict from the liveness detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LivenessLabel {
    #[serde(rename = "real", alias = "live")]
    Live,
    #[serde(rename = "fake", alias = "spoof")]
    Spoof,
}

/// One classified face, folded into the liveness window and then discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationSample {
    pub label: LivenessLabel,
    pub confidence: f32,
}

/// Face bounding box in frame pixel coordinates. Passed through to rendering only.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// A single detector output for one face region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: LivenessLabel,
    pub confidence: f32,
}

impl Detection {
    pub fn sample(&self) -> ClassificationSample {
        ClassificationSample {
            label: self.label,
            confidence: self.confidence,
        }
    }
}

/// Fixed-length face encoding produced by the external encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// A roster entry: the student id and one enrolled encoding.
///
/// A student may appear more than once with different encodings.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub id: String,
    pub embedding: Embedding,
}

/// A resolved match. Only valid for the tick that produced it; the state
/// machine copies the id into its own state.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub distance: f32,
}

/// Student attendance record as held by the attendance store.
///
/// Field names follow the store documents (`total_attendance`,
/// `last_attendance_time`, ...). `last_attendance_time` stays a string so that
/// a malformed value is detected by the updater instead of at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub major: String,
    #[serde(default)]
    pub standing: String,
    #[serde(default)]
    pub year: u32,
    #[serde(default)]
    pub starting_year: u32,
    #[serde(default)]
    pub total_attendance: u32,
    pub last_attendance_time: String,
}

/// What the display panel shows. Also the state machine's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Idle,
    ShowingInfo,
    ShowingAnimation,
    TooSoon,
}

impl DisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Idle => "idle",
            DisplayMode::ShowingInfo => "showing_info",
            DisplayMode::ShowingAnimation => "showing_animation",
            DisplayMode::TooSoon => "too_soon",
        }
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
