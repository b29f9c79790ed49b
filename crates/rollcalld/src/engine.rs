use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use rollcall_core::{
    AttendanceRecord, AttendanceSession, ConfigError, Display, DisplayMode, Embedding,
    EuclideanMatcher, SessionStats, SystemClock, TickReport,
};

use crate::config::Config;
use crate::feed::{FeedDetector, FeedEncoder, Observation};
use crate::store::{AttendanceEvent, SqliteStore, StoreError};

/// How long the engine waits for a frame before serving requests again.
const FRAME_POLL: Duration = Duration::from_millis(50);

type Session = AttendanceSession<FeedDetector, FeedEncoder, EuclideanMatcher, SqliteStore, SystemClock>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Snapshot of the running session, reported over D-Bus.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: DisplayMode,
    pub frame_counter: u32,
    pub active_id: Option<String>,
    pub roster_faces: usize,
    pub liveness_live: usize,
    pub liveness_window: usize,
    pub feed_open: bool,
    pub stats: SessionStats,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Student {
        id: String,
        reply: oneshot::Sender<Result<Option<AttendanceRecord>, EngineError>>,
    },
    Students {
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, EngineError>>,
    },
    UpsertStudent {
        record: AttendanceRecord,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    AddFace {
        id: String,
        embedding: Embedding,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    History {
        id: String,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<AttendanceEvent>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn student(&self, id: &str) -> Result<Option<AttendanceRecord>, EngineError> {
        let id = id.to_string();
        self.request(|reply| EngineRequest::Student { id, reply })
            .await?
    }

    pub async fn students(&self) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.request(|reply| EngineRequest::Students { reply }).await?
    }

    pub async fn upsert_student(&self, record: AttendanceRecord) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::UpsertStudent { record, reply })
            .await?
    }

    /// Enroll an encoding and reload the roster. Returns the face UUID.
    pub async fn add_face(&self, id: &str, embedding: Embedding) -> Result<String, EngineError> {
        let id = id.to_string();
        self.request(|reply| EngineRequest::AddFace {
            id,
            embedding,
            reply,
        })
        .await?
    }

    pub async fn history(&self, id: &str, limit: u32) -> Result<Vec<AttendanceEvent>, EngineError> {
        let id = id.to_string();
        self.request(|reply| EngineRequest::History { id, limit, reply })
            .await?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the roster and builds the attendance session synchronously
/// (fail-fast), then alternates between serving requests and ticking on
/// the next observation.
pub fn spawn_engine(
    config: &Config,
    store: SqliteStore,
    observations: Receiver<Observation>,
) -> Result<EngineHandle, EngineError> {
    let roster = store.load_roster()?;
    let matcher = EuclideanMatcher::new(config.attendance.match_tolerance);
    let mut session = AttendanceSession::new(
        config.attendance.clone(),
        FeedDetector,
        FeedEncoder,
        matcher,
        store,
        config.clock(),
    )?;
    session.replace_roster(roster);

    tracing::info!(
        faces = session.roster_len(),
        window = config.attendance.window_size,
        debounce_secs = config.attendance.debounce.as_secs(),
        utc = config.clock_utc,
        "attendance session ready"
    );

    let (tx, rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || run_loop(session, rx, observations))
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        timeout: config.request_timeout,
    })
}

fn run_loop(
    mut session: Session,
    mut requests: mpsc::Receiver<EngineRequest>,
    observations: Receiver<Observation>,
) {
    tracing::info!("engine thread started");
    let mut feed_open = true;
    let mut requests_open = true;
    let mut last_mode = DisplayMode::Idle;

    loop {
        // Serve queued requests between frames
        while requests_open {
            match requests.try_recv() {
                Ok(req) => handle_request(&mut session, req, feed_open),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => requests_open = false,
            }
        }

        if feed_open {
            match observations.recv_timeout(FRAME_POLL) {
                Ok(observation) => {
                    let report = session.tick(&observation);
                    render(&report, &mut last_mode);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("observation feed closed; serving requests only");
                    feed_open = false;
                }
            }
        } else if requests_open {
            match requests.blocking_recv() {
                Some(req) => handle_request(&mut session, req, feed_open),
                None => requests_open = false,
            }
        } else {
            break;
        }
    }
    tracing::info!(stats = ?session.stats(), "engine thread exiting");
}

/// The daemon has no screen: the display panel is rendered as log lines on
/// mode changes.
fn render(report: &TickReport, last_mode: &mut DisplayMode) {
    if report.mode == *last_mode {
        return;
    }
    match &report.display {
        Display::Info(record) => tracing::info!(
            id = %record.id,
            name = %record.name,
            major = %record.major,
            total = record.total_attendance,
            last = %record.last_attendance_time,
            "display: student info"
        ),
        Display::AlreadyMarked => tracing::info!("display: already marked"),
        Display::Animation | Display::Idle => tracing::debug!(
            from = %last_mode,
            to = %report.mode,
            counter = report.frame_counter,
            "display"
        ),
    }
    *last_mode = report.mode;
}

fn handle_request(session: &mut Session, req: EngineRequest, feed_open: bool) {
    match req {
        EngineRequest::Status { reply } => {
            let state = session.state();
            let liveness = session.liveness();
            let _ = reply.send(EngineStatus {
                mode: state.mode,
                frame_counter: state.frame_counter,
                active_id: state.active_id.clone(),
                roster_faces: session.roster_len(),
                liveness_live: liveness.live,
                liveness_window: liveness.window,
                feed_open,
                stats: session.stats(),
            });
        }
        EngineRequest::Student { id, reply } => {
            let _ = reply.send(session.store().student(&id).map_err(EngineError::from));
        }
        EngineRequest::Students { reply } => {
            let _ = reply.send(session.store().list_students().map_err(EngineError::from));
        }
        EngineRequest::UpsertStudent { record, reply } => {
            let result = session.store().upsert_student(&record);
            if result.is_ok() {
                tracing::info!(id = %record.id, "student saved");
            }
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::AddFace {
            id,
            embedding,
            reply,
        } => {
            let _ = reply.send(add_face(session, &id, &embedding));
        }
        EngineRequest::History { id, limit, reply } => {
            let _ = reply.send(session.store().history(&id, limit).map_err(EngineError::from));
        }
    }
}

fn add_face(session: &mut Session, id: &str, embedding: &Embedding) -> Result<String, EngineError> {
    let face_id = session.store().add_face(id, embedding)?;
    let roster = session.store().load_roster()?;
    session.replace_roster(roster);
    tracing::info!(id, face_id = %face_id, "face enrolled");
    Ok(face_id)
}
