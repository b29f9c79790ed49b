//! The attendance debounce state machine.
//!
//! A recognised live face starts a fixed-length display cycle:
//!
//! ```text
//!  Idle ──activate──▶ ShowingInfo (ticks 1..=K1) ──▶ ShowingAnimation (K1+1..K2) ──▶ Idle
//!    │                                                                                 ▲
//!    └──activate (too soon / not found)──▶ TooSoon ──next tick──────────────────────────┘
//! ```
//!
//! Once a cycle runs it is driven by the tick counter alone. Faces leaving
//! or entering the frame do not interrupt it.

use serde::Serialize;

use crate::config::AttendanceConfig;
use crate::types::{AttendanceRecord, DisplayMode, Identity};
use crate::updater::UpdateOutcome;

/// The only state carried from one tick to the next.
///
/// `active_id` and `cached_record` are set and cleared together;
/// `frame_counter` is zero whenever the mode is `Idle` or `TooSoon`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineState {
    pub mode: DisplayMode,
    pub frame_counter: u32,
    pub active_id: Option<String>,
    pub cached_record: Option<AttendanceRecord>,
}

/// What the renderer should draw in the side panel this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Display {
    Idle,
    Info(AttendanceRecord),
    Animation,
    AlreadyMarked,
}

/// Result of advancing a running cycle by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// No cycle was running.
    Inactive,
    Holding,
    /// The counter reached the cycle length and the machine is idle again.
    Completed,
}

#[derive(Debug, Clone)]
pub struct AttendanceMachine {
    state: MachineState,
    info_ticks: u32,
    cycle_ticks: u32,
}

impl AttendanceMachine {
    pub fn new(config: &AttendanceConfig) -> Self {
        Self {
            state: MachineState::default(),
            info_ticks: config.info_ticks,
            cycle_ticks: config.cycle_ticks,
        }
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn mode(&self) -> DisplayMode {
        self.state.mode
    }

    /// True when a new recognition may start a cycle this tick.
    pub fn is_idle_eligible(&self) -> bool {
        matches!(self.state.mode, DisplayMode::Idle | DisplayMode::TooSoon)
    }

    /// Start a cycle for `identity` given the record updater's verdict.
    ///
    /// Must only be called while idle-eligible; returns false and leaves the
    /// running cycle alone otherwise.
    pub fn activate(&mut self, identity: &Identity, outcome: &UpdateOutcome) -> bool {
        if !self.is_idle_eligible() {
            tracing::warn!(
                id = %identity.id,
                mode = %self.state.mode,
                "activation ignored: cycle already running"
            );
            return false;
        }

        match outcome.display_record() {
            Some(record) => {
                self.state = MachineState {
                    mode: DisplayMode::ShowingInfo,
                    frame_counter: 1,
                    active_id: Some(identity.id.clone()),
                    cached_record: Some(record.clone()),
                };
                tracing::info!(id = %identity.id, outcome = outcome.kind(), "display cycle started");
            }
            None => {
                // Fast reject: no dwell, eligible again next tick
                self.state = MachineState {
                    mode: DisplayMode::TooSoon,
                    ..MachineState::default()
                };
                tracing::info!(id = %identity.id, outcome = outcome.kind(), "recognition rejected");
            }
        }
        true
    }

    /// Move a running cycle forward by one tick.
    pub fn advance(&mut self) -> Advance {
        match self.state.mode {
            DisplayMode::Idle | DisplayMode::TooSoon => Advance::Inactive,
            DisplayMode::ShowingInfo | DisplayMode::ShowingAnimation => {
                self.state.frame_counter += 1;
                let counter = self.state.frame_counter;
                if counter >= self.cycle_ticks {
                    tracing::info!(
                        id = ?self.state.active_id,
                        "display cycle complete"
                    );
                    self.reset();
                    Advance::Completed
                } else {
                    self.state.mode = if counter > self.info_ticks {
                        DisplayMode::ShowingAnimation
                    } else {
                        DisplayMode::ShowingInfo
                    };
                    Advance::Holding
                }
            }
        }
    }

    /// A tick without activation: the too-soon marker lasts one tick only.
    pub fn settle(&mut self) {
        if self.state.mode == DisplayMode::TooSoon {
            self.state.mode = DisplayMode::Idle;
        }
    }

    pub fn reset(&mut self) {
        self.state = MachineState::default();
    }

    pub fn display(&self) -> Display {
        match self.state.mode {
            DisplayMode::Idle => Display::Idle,
            DisplayMode::ShowingInfo => match &self.state.cached_record {
                Some(record) => Display::Info(record.clone()),
                None => Display::Idle,
            },
            DisplayMode::ShowingAnimation => Display::Animation,
            DisplayMode::TooSoon => Display::AlreadyMarked,
        }
    }
}
