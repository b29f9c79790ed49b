//! Interfaces to the external detector, encoder and matcher.
//!
//! Implementations wrap inference engines that live outside this crate.
//! Both frame-consuming traits may be stateful, hence `&mut self`.

use thiserror::Error;

use crate::types::{Detection, Embedding, KnownFace};

/// A detector or encoder call that failed for this frame.
///
/// Always transient: the tick is skipped and the next frame retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("liveness detector failed: {0}")]
    Detector(String),
    #[error("face encoder failed: {0}")]
    Encoder(String),
    #[error("inference timed out")]
    Timeout,
}

/// Classifies every face region in a frame as live or spoofed.
pub trait Detector {
    type Frame;

    fn classify(&mut self, frame: &Self::Frame) -> Result<Vec<Detection>, DetectionError>;
}

/// Computes one embedding per face found in a frame, in detector order.
pub trait Encoder {
    type Frame;

    fn encode(&mut self, frame: &Self::Frame) -> Result<Vec<Embedding>, DetectionError>;
}

/// Nearest known face for one embedding, plus the matcher's own verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    /// Index into the roster slice passed to [`Matcher::nearest`].
    pub index: usize,
    pub distance: f32,
    /// Whether the distance clears the matcher's acceptance threshold.
    pub is_match: bool,
}

/// Finds the closest roster entry. The acceptance decision belongs to the
/// matcher; callers never reinterpret `distance`.
pub trait Matcher {
    /// `None` when the roster is empty or has no comparable entry.
    fn nearest(&self, embedding: &Embedding, known: &[KnownFace]) -> Option<MatchCandidate>;
}
