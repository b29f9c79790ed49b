//! rollcall-core: liveness-gated attendance marking.
//!
//! Folds per-frame liveness labels into a stable decision, resolves a live
//! face against the known roster, and drives a fixed-duration display cycle
//! that records each attendance at most once per debounce interval.
//!
//! The detector, encoder, matcher, attendance store and clock are consumed
//! through the traits in [`capability`], [`store`] and [`clock`], so the
//! state machine runs without a camera or a database.

pub mod capability;
pub mod clock;
pub mod config;
pub mod liveness;
pub mod machine;
pub mod matcher;
pub mod resolver;
pub mod session;
pub mod store;
pub mod types;
pub mod updater;

pub use capability::{DetectionError, Detector, Encoder, MatchCandidate, Matcher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AttendanceConfig, ConfigError};
pub use liveness::LivenessAggregator;
pub use machine::{Advance, AttendanceMachine, Display, MachineState};
pub use matcher::EuclideanMatcher;
pub use resolver::IdentityResolver;
pub use session::{AttendanceSession, SessionStats, TickError, TickReport};
pub use store::{AttendanceStore, MemoryStore, RecordField, StoreError};
pub use types::{
    AttendanceRecord, BoundingBox, ClassificationSample, Detection, DisplayMode, Embedding,
    Identity, KnownFace, LivenessLabel,
};
pub use updater::{NotFoundReason, RecordUpdater, UpdateOutcome};
