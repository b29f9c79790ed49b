//! Per-frame observations from the inference sidecar.
//!
//! Camera capture, anti-spoofing inference and face encoding run in a
//! separate process that writes one JSON object per frame:
//!
//! ```json
//! {"detections":[{"bbox":{"x1":120,"y1":80,"x2":260,"y2":250},"label":"real","confidence":0.93}],
//!  "encodings":[[-0.091, 0.113, ...]]}
//! ```
//!
//! A failed inference call is reported inline with `detector_error` or
//! `encoder_error`; the engine treats it as a transient tick failure.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::thread::JoinHandle;

use serde::Deserialize;
use thiserror::Error;

use rollcall_core::{DetectionError, Detection, Detector, Embedding, Encoder};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed to open feed {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed observation: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("feed line is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("failed to spawn feed reader: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Everything the sidecar reports for one camera frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// One encoding per face, in detection order.
    #[serde(default)]
    pub encodings: Vec<Vec<f32>>,
    #[serde(default)]
    pub detector_error: Option<String>,
    #[serde(default)]
    pub encoder_error: Option<String>,
}

/// Parse one feed line. `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<Observation>, FeedError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Parse one raw feed line, which may not be valid UTF-8.
fn parse_bytes(line: &[u8]) -> Result<Option<Observation>, FeedError> {
    let line = std::str::from_utf8(line)?;
    parse_line(line)
}

/// Detector capability backed by the sidecar's labels.
pub struct FeedDetector;

impl Detector for FeedDetector {
    type Frame = Observation;

    fn classify(&mut self, frame: &Observation) -> Result<Vec<Detection>, DetectionError> {
        if let Some(e) = &frame.detector_error {
            return Err(DetectionError::Detector(e.clone()));
        }
        Ok(frame.detections.clone())
    }
}

/// Encoder capability backed by the sidecar's encodings.
pub struct FeedEncoder;

impl Encoder for FeedEncoder {
    type Frame = Observation;

    fn encode(&mut self, frame: &Observation) -> Result<Vec<Embedding>, DetectionError> {
        if let Some(e) = &frame.encoder_error {
            return Err(DetectionError::Encoder(e.clone()));
        }
        Ok(frame.encodings.iter().cloned().map(Embedding::new).collect())
    }
}

/// Start a thread reading observations from `source` (`-` for stdin).
///
/// The channel is bounded, so a slow engine stalls the reader rather than
/// queueing stale frames. The thread exits at end of input or when the
/// engine hangs up.
pub fn spawn_reader(
    source: &str,
    tx: SyncSender<Observation>,
) -> Result<JoinHandle<()>, FeedError> {
    let mut reader: Box<dyn BufRead + Send> = if source == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(source).map_err(|source_err| FeedError::Open {
            path: PathBuf::from(source),
            source: source_err,
        })?;
        Box::new(BufReader::new(file))
    };
    let source = source.to_string();

    std::thread::Builder::new()
        .name("rollcall-feed".into())
        .spawn(move || {
            tracing::info!(source = %source, "feed reader started");
            let mut dropped = 0u64;
            let mut buf = Vec::new();
            let mut lineno = 0usize;
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => lineno += 1,
                    Err(e) => {
                        tracing::error!(error = %e, "feed read failed");
                        break;
                    }
                }
                match parse_bytes(&buf) {
                    Ok(Some(observation)) => {
                        if tx.send(observation).is_err() {
                            tracing::info!("engine gone; feed reader stopping");
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        dropped += 1;
                        tracing::warn!(line = lineno, error = %e, "dropping malformed frame");
                    }
                }
            }
            tracing::info!(dropped, "feed reader reached end of input");
        })
        .map_err(FeedError::Spawn)
}
