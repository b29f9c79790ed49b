//! Liveness aggregation over a short sliding window of detector labels.
//!
//! The anti-spoofing detector classifies every face it sees as live or
//! spoofed, one frame at a time. Single frames are noisy: motion blur or a
//! hand crossing the face flips a label now and then. The aggregator keeps
//! the last `N` labels and reports a stable live face only when at least
//! `threshold` of them (default `N - 1`) are live.
//!
//! # Behaviour
//!
//! - One conflicting frame inside a full window is tolerated.
//! - Sustained spoof evidence suppresses activation within a few frames,
//!   since the window is short rather than an average over long history.
//! - A partial window (right after startup or [`LivenessAggregator::reset`])
//!   follows the same counting rule, so early ticks need near-unanimous
//!   evidence.

use std::collections::VecDeque;

use crate::config::DEFAULT_WINDOW_SIZE;
use crate::types::{Detection, LivenessLabel};

/// Counts over the current window, for logging and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSnapshot {
    pub live: usize,
    pub spoof: usize,
    pub window: usize,
    pub stable: bool,
}

/// Sliding-window majority vote over liveness labels.
#[derive(Debug, Clone)]
pub struct LivenessAggregator {
    window: VecDeque<LivenessLabel>,
    capacity: usize,
    threshold: usize,
}

impl Default for LivenessAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE - 1)
    }
}

impl LivenessAggregator {
    /// Create an aggregator keeping `capacity` labels and requiring
    /// `threshold` live ones. A zero capacity is raised to 1.
    pub fn new(capacity: usize, threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            threshold,
        }
    }

    /// Push one label, evicting the oldest when the window is full.
    pub fn observe(&mut self, label: LivenessLabel) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(label);
    }

    /// Fold every detection above `cutoff` into the window, in detector order.
    ///
    /// Returns how many samples were taken.
    pub fn observe_detections(&mut self, detections: &[Detection], cutoff: f32) -> usize {
        let mut taken = 0;
        for detection in detections.iter().filter(|d| d.confidence > cutoff) {
            self.observe(detection.label);
            taken += 1;
        }
        taken
    }

    /// True iff at least `threshold` labels in the current window are live.
    pub fn is_stable_live(&self) -> bool {
        self.live_count() >= self.threshold
    }

    /// Clear the window. The next decision starts from no evidence.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn live_count(&self) -> usize {
        self.window
            .iter()
            .filter(|l| **l == LivenessLabel::Live)
            .count()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        let live = self.live_count();
        LivenessSnapshot {
            live,
            spoof: self.window.len() - live,
            window: self.window.len(),
            stable: live >= self.threshold,
        }
    }
}
