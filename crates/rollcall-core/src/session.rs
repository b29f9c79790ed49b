//! One processing tick: liveness → identity → record update → display phase.

use serde::Serialize;
use thiserror::Error;

use crate::capability::{DetectionError, Detector, Encoder, Matcher};
use crate::clock::Clock;
use crate::config::{AttendanceConfig, ConfigError};
use crate::liveness::{LivenessAggregator, LivenessSnapshot};
use crate::machine::{Advance, AttendanceMachine, Display, MachineState};
use crate::resolver::IdentityResolver;
use crate::store::AttendanceStore;
use crate::types::{Detection, DisplayMode, Identity, KnownFace};
use crate::updater::{RecordUpdater, UpdateOutcome};

/// A tick that could not run its detection steps. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error("transient detection failure: {0}")]
    Transient(#[from] DetectionError),
}

/// Everything the renderer and the logs need about one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub mode: DisplayMode,
    pub frame_counter: u32,
    pub display: Display,
    /// Detections for this frame, for drawing boxes.
    pub detections: Vec<Detection>,
    pub liveness: LivenessSnapshot,
    /// Set on the tick that ran the record updater.
    pub identity: Option<Identity>,
    pub outcome: Option<UpdateOutcome>,
    /// The cycle reached its end on this tick.
    pub completed: bool,
    pub error: Option<TickError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub ticks: u64,
    pub activations: u64,
    pub written: u64,
    pub write_failed: u64,
    pub too_soon: u64,
    pub not_found: u64,
    pub transient_errors: u64,
    pub completed_cycles: u64,
}

/// Owns the per-run state and the capabilities a tick needs.
///
/// Ticks run strictly one after another on the caller's thread.
pub struct AttendanceSession<D, E, M, S, C> {
    config: AttendanceConfig,
    detector: D,
    encoder: E,
    matcher: M,
    store: S,
    clock: C,
    liveness: LivenessAggregator,
    resolver: IdentityResolver,
    updater: RecordUpdater,
    machine: AttendanceMachine,
    roster: Vec<KnownFace>,
    stats: SessionStats,
}

impl<D, E, M, S, C> AttendanceSession<D, E, M, S, C>
where
    D: Detector,
    E: Encoder<Frame = D::Frame>,
    M: Matcher,
    S: AttendanceStore,
    C: Clock,
{
    pub fn new(
        config: AttendanceConfig,
        detector: D,
        encoder: E,
        matcher: M,
        store: S,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            liveness: LivenessAggregator::new(config.window_size, config.stability_threshold),
            resolver: IdentityResolver::new(),
            updater: RecordUpdater::new(config.debounce),
            machine: AttendanceMachine::new(&config),
            config,
            detector,
            encoder,
            matcher,
            store,
            clock,
            roster: Vec::new(),
            stats: SessionStats::default(),
        })
    }

    /// Process one frame.
    pub fn tick(&mut self, frame: &D::Frame) -> TickReport {
        self.stats.ticks += 1;

        let detections = match self.detector.classify(frame) {
            Ok(detections) => detections,
            Err(e) => {
                // Recognition needs this frame; a running cycle does not.
                let completed = if self.machine.is_idle_eligible() {
                    self.machine.settle();
                    false
                } else {
                    self.advance_cycle()
                };
                return self.skip(Vec::new(), e, completed);
            }
        };
        self.liveness
            .observe_detections(&detections, self.config.confidence_cutoff);

        let mut identity = None;
        let mut outcome = None;
        let mut completed = false;

        if self.machine.is_idle_eligible() {
            if self.liveness.is_stable_live() {
                match self
                    .resolver
                    .resolve(frame, &self.roster, &mut self.encoder, &self.matcher)
                {
                    Ok(Some(found)) => {
                        let result = self.updater.update(&mut self.store, &self.clock, &found.id);
                        self.count(&result);
                        self.machine.activate(&found, &result);
                        identity = Some(found);
                        outcome = Some(result);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.machine.settle();
                        return self.skip(detections, e, false);
                    }
                }
            }
            if outcome.is_none() {
                self.machine.settle();
            }
        } else {
            completed = self.advance_cycle();
        }

        let state = self.machine.state();
        tracing::trace!(
            mode = %state.mode,
            counter = state.frame_counter,
            faces = detections.len(),
            "tick"
        );

        TickReport {
            mode: state.mode,
            frame_counter: state.frame_counter,
            display: self.machine.display(),
            detections,
            liveness: self.liveness.snapshot(),
            identity,
            outcome,
            completed,
            error: None,
        }
    }

    /// Move a running cycle on by one tick. Returns true when it finished.
    fn advance_cycle(&mut self) -> bool {
        if self.machine.advance() != Advance::Completed {
            return false;
        }
        // A fresh liveness judgment is required for the next cycle
        self.liveness.reset();
        self.stats.completed_cycles += 1;
        true
    }

    /// Report a tick whose detection work failed. Nothing was recognised and
    /// the liveness window did not see the frame.
    fn skip(
        &mut self,
        detections: Vec<Detection>,
        error: DetectionError,
        completed: bool,
    ) -> TickReport {
        self.stats.transient_errors += 1;
        tracing::debug!(error = %error, "tick skipped");
        let state = self.machine.state();
        TickReport {
            mode: state.mode,
            frame_counter: state.frame_counter,
            display: self.machine.display(),
            detections,
            liveness: self.liveness.snapshot(),
            identity: None,
            outcome: None,
            completed,
            error: Some(TickError::Transient(error)),
        }
    }

    fn count(&mut self, outcome: &UpdateOutcome) {
        self.stats.activations += 1;
        match outcome {
            UpdateOutcome::WrittenOrFresh(_) => self.stats.written += 1,
            UpdateOutcome::WriteFailed { .. } => self.stats.write_failed += 1,
            UpdateOutcome::TooSoon { .. } => self.stats.too_soon += 1,
            UpdateOutcome::NotFound(_) => self.stats.not_found += 1,
        }
    }

    /// Swap in a new roster. Takes effect on the next recognition.
    pub fn replace_roster(&mut self, roster: Vec<KnownFace>) {
        tracing::info!(faces = roster.len(), "roster replaced");
        self.roster = roster;
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn state(&self) -> &MachineState {
        self.machine.state()
    }

    pub fn liveness(&self) -> LivenessSnapshot {
        self.liveness.snapshot()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> &AttendanceConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{format_timestamp, ManualClock};
    use crate::matcher::EuclideanMatcher;
    use crate::store::MemoryStore;
    use crate::types::{AttendanceRecord, BoundingBox, Embedding, LivenessLabel};

    /// What the external inference would report for one camera frame.
    #[derive(Debug, Clone, Default)]
    struct ScriptedFrame {
        labels: Vec<LivenessLabel>,
        encodings: Vec<Vec<f32>>,
        fail_detector: bool,
        fail_encoder: bool,
    }

    impl ScriptedFrame {
        fn live() -> Self {
            Self {
                labels: vec![LivenessLabel::Live],
                ..Default::default()
            }
        }

        fn live_face(encoding: Vec<f32>) -> Self {
            Self {
                labels: vec![LivenessLabel::Live],
                encodings: vec![encoding],
                ..Default::default()
            }
        }

        fn empty() -> Self {
            Self::default()
        }
    }

    struct ScriptedDetector;

    impl Detector for ScriptedDetector {
        type Frame = ScriptedFrame;

        fn classify(&mut self, frame: &ScriptedFrame) -> Result<Vec<Detection>, DetectionError> {
            if frame.fail_detector {
                return Err(DetectionError::Detector("cuda context lost".into()));
            }
            Ok(frame
                .labels
                .iter()
                .map(|label| Detection {
                    bbox: BoundingBox::default(),
                    label: *label,
                    confidence: 0.9,
                })
                .collect())
        }
    }

    struct ScriptedEncoder;

    impl Encoder for ScriptedEncoder {
        type Frame = ScriptedFrame;

        fn encode(&mut self, frame: &ScriptedFrame) -> Result<Vec<Embedding>, DetectionError> {
            if frame.fail_encoder {
                return Err(DetectionError::Timeout);
            }
            Ok(frame.encodings.iter().cloned().map(Embedding::new).collect())
        }
    }

    type TestSession =
        AttendanceSession<ScriptedDetector, ScriptedEncoder, EuclideanMatcher, MemoryStore, ManualClock>;

    const S001: [f32; 3] = [0.9, 0.1, 0.0];

    fn student(last: &str) -> AttendanceRecord {
        AttendanceRecord {
            id: "S001".to_string(),
            name: "Emmy Noether".to_string(),
            major: "Mathematics".to_string(),
            standing: "G".to_string(),
            year: 3,
            starting_year: 2022,
            total_attendance: 10,
            last_attendance_time: last.to_string(),
        }
    }

    fn session() -> TestSession {
        let mut store = MemoryStore::new();
        store.insert(student("2000-01-01 00:00:00"));
        let clock = ManualClock::at("2024-09-02 09:00:00").unwrap();
        let mut session = AttendanceSession::new(
            AttendanceConfig::default(),
            ScriptedDetector,
            ScriptedEncoder,
            EuclideanMatcher::default(),
            store,
            clock,
        )
        .unwrap();
        session.replace_roster(vec![
            KnownFace {
                id: "S001".to_string(),
                embedding: Embedding::new(vec![1.0, 0.0, 0.0]),
            },
            KnownFace {
                id: "S002".to_string(),
                embedding: Embedding::new(vec![0.0, 1.0, 0.0]),
            },
        ]);
        session
    }

    /// Four live frames without a face encoding, then a recognisable one.
    fn recognise(session: &mut TestSession) -> TickReport {
        for _ in 0..4 {
            let report = session.tick(&ScriptedFrame::live());
            assert_eq!(report.mode, DisplayMode::Idle);
        }
        session.tick(&ScriptedFrame::live_face(S001.to_vec()))
    }

    fn total(session: &TestSession) -> u32 {
        session.store().record("S001").unwrap().total_attendance
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = AttendanceConfig {
            window_size: 0,
            ..Default::default()
        };
        let result = AttendanceSession::new(
            config,
            ScriptedDetector,
            ScriptedEncoder,
            EuclideanMatcher::default(),
            MemoryStore::new(),
            ManualClock::at("2024-09-02 09:00:00").unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_full_cycle() {
        let mut session = session();
        let report = recognise(&mut session);

        assert_eq!(report.mode, DisplayMode::ShowingInfo);
        assert_eq!(report.frame_counter, 1);
        assert!(matches!(report.outcome, Some(UpdateOutcome::WrittenOrFresh(_))));
        assert_eq!(report.identity.as_ref().map(|i| i.id.as_str()), Some("S001"));
        assert_eq!(total(&session), 11);
        let Display::Info(shown) = &report.display else {
            panic!("expected info panel, got {:?}", report.display);
        };
        assert_eq!(shown.total_attendance, 11);
        assert_eq!(session.state().active_id.as_deref(), Some("S001"));

        for _ in 0..39 {
            let report = session.tick(&ScriptedFrame::empty());
            assert_eq!(report.mode, DisplayMode::ShowingInfo);
        }
        assert_eq!(session.state().frame_counter, 40);

        let report = session.tick(&ScriptedFrame::empty());
        assert_eq!(report.mode, DisplayMode::ShowingAnimation);
        assert_eq!(report.frame_counter, 41);
        assert_eq!(report.display, Display::Animation);

        for _ in 0..28 {
            let report = session.tick(&ScriptedFrame::empty());
            assert_eq!(report.mode, DisplayMode::ShowingAnimation);
        }

        let report = session.tick(&ScriptedFrame::empty());
        assert!(report.completed);
        assert_eq!(report.mode, DisplayMode::Idle);
        assert_eq!(report.frame_counter, 0);
        assert_eq!(session.state(), &MachineState::default());
        assert_eq!(session.liveness().window, 0);

        assert_eq!(total(&session), 11);
        let stats = session.stats();
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.completed_cycles, 1);
    }

    #[test]
    fn test_updater_runs_once_per_activation() {
        let mut session = session();
        recognise(&mut session);
        assert_eq!(session.store().reads(), 1);

        // The student stays in front of the camera for the whole cycle
        for _ in 0..68 {
            session.tick(&ScriptedFrame::live_face(S001.to_vec()));
        }
        assert_eq!(session.state().frame_counter, 69);
        assert_eq!(session.store().reads(), 1);
        assert_eq!(session.store().writes(), 2);
        assert_eq!(session.stats().activations, 1);
    }

    #[test]
    fn test_cycle_survives_absent_face() {
        let mut session = session();
        recognise(&mut session);

        for tick in 2..70 {
            let report = session.tick(&ScriptedFrame::empty());
            assert_ne!(report.mode, DisplayMode::Idle, "reset early at tick {tick}");
            assert_eq!(report.frame_counter, tick);
        }
        let report = session.tick(&ScriptedFrame::empty());
        assert_eq!(report.mode, DisplayMode::Idle);
    }

    #[test]
    fn test_spoof_labels_do_not_interrupt_cycle() {
        let mut session = session();
        recognise(&mut session);
        let spoof = ScriptedFrame {
            labels: vec![LivenessLabel::Spoof],
            ..Default::default()
        };
        for _ in 0..10 {
            session.tick(&spoof);
        }
        assert_eq!(session.state().frame_counter, 11);
        assert_eq!(session.state().mode, DisplayMode::ShowingInfo);
    }

    #[test]
    fn test_too_soon_after_recent_write() {
        let mut session = session();
        recognise(&mut session);
        for _ in 0..69 {
            session.tick(&ScriptedFrame::empty());
        }
        assert_eq!(session.state().mode, DisplayMode::Idle);

        // Written at 09:00:00; second recognition 5 seconds later
        session.clock().advance_secs(5);
        let report = recognise(&mut session);
        assert!(matches!(report.outcome, Some(UpdateOutcome::TooSoon { elapsed_secs }) if elapsed_secs == 5.0));
        assert_eq!(report.mode, DisplayMode::TooSoon);
        assert_eq!(report.frame_counter, 0);
        assert_eq!(report.display, Display::AlreadyMarked);
        assert_eq!(total(&session), 11);

        let report = session.tick(&ScriptedFrame::empty());
        assert_eq!(report.mode, DisplayMode::Idle);
        assert_eq!(session.stats().too_soon, 1);
    }

    #[test]
    fn test_too_soon_retries_on_next_tick() {
        let mut session = session();
        session
            .store_mut()
            .insert(student("2024-09-02 08:59:55"));

        let report = recognise(&mut session);
        assert_eq!(report.mode, DisplayMode::TooSoon);

        // Liveness window kept: the very next frame is evaluated again
        session.clock().advance_secs(30);
        let report = session.tick(&ScriptedFrame::live_face(S001.to_vec()));
        assert!(matches!(report.outcome, Some(UpdateOutcome::WrittenOrFresh(_))));
        assert_eq!(report.mode, DisplayMode::ShowingInfo);
        assert_eq!(
            session.store().record("S001").unwrap().last_attendance_time,
            format_timestamp(&session.clock().now())
        );
    }

    #[test]
    fn test_unknown_student_takes_reject_path() {
        let mut session = session();
        for _ in 0..4 {
            session.tick(&ScriptedFrame::live());
        }
        // S002 is on the roster but has no attendance record
        let report = session.tick(&ScriptedFrame::live_face(vec![0.0, 1.0, 0.0]));
        assert!(matches!(report.outcome, Some(UpdateOutcome::NotFound(_))));
        assert_eq!(report.mode, DisplayMode::TooSoon);
        assert_eq!(report.frame_counter, 0);
        assert_eq!(session.stats().not_found, 1);
    }

    #[test]
    fn test_spoof_never_activates() {
        let mut session = session();
        let spoof_face = ScriptedFrame {
            labels: vec![LivenessLabel::Spoof],
            encodings: vec![S001.to_vec()],
            ..Default::default()
        };
        for _ in 0..20 {
            let report = session.tick(&spoof_face);
            assert_eq!(report.mode, DisplayMode::Idle);
            assert!(report.outcome.is_none());
        }
        assert_eq!(session.store().reads(), 0);
    }

    #[test]
    fn test_detector_error_keeps_cycle_running() {
        let mut session = session();
        recognise(&mut session);
        let liveness = session.liveness();

        let report = session.tick(&ScriptedFrame {
            fail_detector: true,
            ..Default::default()
        });
        assert!(matches!(report.error, Some(TickError::Transient(_))));
        assert!(report.outcome.is_none());
        assert_eq!(report.mode, DisplayMode::ShowingInfo);
        assert_eq!(report.frame_counter, 2);
        assert_eq!(session.liveness(), liveness);

        let report = session.tick(&ScriptedFrame::empty());
        assert_eq!(report.frame_counter, 3);
        assert_eq!(session.stats().transient_errors, 1);
    }

    #[test]
    fn test_cycle_completes_while_detector_down() {
        let mut session = session();
        recognise(&mut session);
        let failing = ScriptedFrame {
            fail_detector: true,
            ..Default::default()
        };
        for _ in 0..68 {
            let report = session.tick(&failing);
            assert!(!report.completed);
        }
        let report = session.tick(&failing);
        assert!(report.completed);
        assert_eq!(report.mode, DisplayMode::Idle);
        assert_eq!(session.stats().completed_cycles, 1);
        assert_eq!(session.stats().written, 1);
    }

    #[test]
    fn test_detector_error_while_idle_changes_nothing() {
        let mut session = session();
        for _ in 0..3 {
            session.tick(&ScriptedFrame::live());
        }
        let liveness = session.liveness();
        let report = session.tick(&ScriptedFrame {
            fail_detector: true,
            ..Default::default()
        });
        assert!(report.error.is_some());
        assert_eq!(session.state(), &MachineState::default());
        assert_eq!(session.liveness(), liveness);
        assert_eq!(session.store().reads(), 0);
    }

    #[test]
    fn test_encoder_error_skips_recognition() {
        let mut session = session();
        for _ in 0..4 {
            session.tick(&ScriptedFrame::live());
        }
        let report = session.tick(&ScriptedFrame {
            labels: vec![LivenessLabel::Live],
            encodings: vec![S001.to_vec()],
            fail_encoder: true,
            ..Default::default()
        });
        assert!(report.error.is_some());
        assert_eq!(report.mode, DisplayMode::Idle);
        assert_eq!(session.store().reads(), 0);

        let report = session.tick(&ScriptedFrame::live_face(S001.to_vec()));
        assert_eq!(report.mode, DisplayMode::ShowingInfo);
    }

    #[test]
    fn test_no_face_while_idle_is_a_noop() {
        let mut session = session();
        for _ in 0..10 {
            let report = session.tick(&ScriptedFrame::empty());
            assert_eq!(report.mode, DisplayMode::Idle);
            assert!(report.detections.is_empty());
        }
        assert_eq!(session.state(), &MachineState::default());
        assert_eq!(session.store().reads(), 0);
    }

    #[test]
    fn test_new_cycle_needs_fresh_liveness() {
        let mut session = session();
        session.clock().advance_secs(-3600);
        recognise(&mut session);
        for _ in 0..69 {
            session.tick(&ScriptedFrame::empty());
        }
        session.clock().advance_secs(3600);

        // Window was cleared at reset: three live frames are not enough
        for _ in 0..3 {
            let report = session.tick(&ScriptedFrame::live_face(S001.to_vec()));
            assert_eq!(report.mode, DisplayMode::Idle);
        }
        let report = session.tick(&ScriptedFrame::live_face(S001.to_vec()));
        assert_eq!(report.mode, DisplayMode::ShowingInfo);
        assert_eq!(total(&session), 12);
    }
}
