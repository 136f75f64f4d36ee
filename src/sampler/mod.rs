// Frame sampler
//
// Extracts frames at a fixed stride and asks the external detectors about
// each one. Perception is entirely external; this module owns the stride
// math, per-frame error isolation and keeping records in frame order.

pub mod detector;
pub mod ffmpeg;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{CameraZones, ScanMode, Zone};
use crate::error::{PackError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Packing,
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Observation {
    /// Hand presence in the packing zone.
    Hand(bool),
    /// Strings decoded in the trigger zone (possibly none).
    Codes(Vec<String>),
}

/// One observation for one (frame, zone) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Offset from the start of the file.
    pub frame_ms: i64,
    pub zone: ZoneKind,
    pub observation: Observation,
    pub confidence: Option<f32>,
}

impl DetectionRecord {
    pub fn hand(frame_ms: i64, present: bool, confidence: Option<f32>) -> Self {
        Self {
            frame_ms,
            zone: ZoneKind::Packing,
            observation: Observation::Hand(present),
            confidence,
        }
    }

    pub fn codes(frame_ms: i64, codes: Vec<String>) -> Self {
        Self {
            frame_ms,
            zone: ZoneKind::Trigger,
            observation: Observation::Codes(codes),
            confidence: None,
        }
    }
}

/// A decoded frame on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u64,
    pub offset_ms: i64,
    pub path: PathBuf,
}

/// Offset of the `index`-th sampled frame for a given stride.
pub fn frame_offset_ms(index: u64, interval_ms: u64) -> i64 {
    index.saturating_mul(interval_ms).min(i64::MAX as u64) as i64
}

/// Decodes a video into frames at a fixed stride.
pub trait FrameSource: Send + Sync {
    /// Write frames for `video` into `scratch` and return them in time order.
    fn extract(&self, video: &Path, interval_ms: u64, scratch: &Path) -> Result<Vec<Frame>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandReading {
    pub present: bool,
    pub confidence: Option<f32>,
}

pub trait HandDetector: Send + Sync {
    fn detect_hand_presence(&self, frame: &Frame, zone: &Zone) -> Result<HandReading>;
}

pub trait QrDecoder: Send + Sync {
    fn decode_qr(&self, frame: &Frame, zone: &Zone) -> Result<Vec<String>>;
}

/// The three external collaborators a worker needs for one file.
#[derive(Clone)]
pub struct Pipeline {
    pub frames: Arc<dyn FrameSource>,
    pub hands: Arc<dyn HandDetector>,
    pub qr: Arc<dyn QrDecoder>,
}

impl Pipeline {
    pub fn new(frames: Arc<dyn FrameSource>, hands: Arc<dyn HandDetector>, qr: Arc<dyn QrDecoder>) -> Self {
        Self { frames, hands, qr }
    }

    /// ffmpeg for frames and one external detector program for both zones.
    pub fn external() -> Self {
        let detector = Arc::new(detector::CommandDetector::new(crate::tools::detector_path()));
        Self {
            frames: Arc::new(ffmpeg::FfmpegFrameSource::new(crate::tools::ffmpeg_path())),
            hands: detector.clone(),
            qr: detector,
        }
    }
}

/// Sample one file: one record per (frame, zone) pair, in frame order.
///
/// A frame the detectors reject is logged and skipped. A detector timeout
/// aborts the file with a transient error. If every frame is rejected the
/// file is reported as unreadable.
pub fn sample(
    pipeline: &Pipeline,
    file_path: &Path,
    zones: &CameraZones,
    frame_interval_ms: u64,
    scan_mode: ScanMode,
) -> Result<Vec<DetectionRecord>> {
    let scratch = tempfile::Builder::new().prefix("packcam-frames-").tempdir()?;
    let mut frames = pipeline.frames.extract(file_path, frame_interval_ms, scratch.path())?;
    frames.sort_by_key(|f| f.offset_ms);

    let trigger = if scan_mode.decodes_codes() { zones.trigger } else { None };
    let mut records = Vec::with_capacity(frames.len() * if trigger.is_some() { 2 } else { 1 });
    let mut failed_frames = 0usize;

    for frame in &frames {
        let hand = match pipeline.hands.detect_hand_presence(frame, &zones.packing) {
            Ok(reading) => reading,
            Err(e @ PackError::DetectorTimeout(_)) => return Err(e),
            Err(e) => {
                log::warn!("Frame {} of {} skipped: {}", frame.index, file_path.display(), e);
                failed_frames += 1;
                continue;
            }
        };

        let codes = match trigger {
            Some(zone) => match pipeline.qr.decode_qr(frame, &zone) {
                Ok(codes) => Some(codes),
                Err(e @ PackError::DetectorTimeout(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Frame {} of {} skipped: {}", frame.index, file_path.display(), e);
                    failed_frames += 1;
                    continue;
                }
            },
            None => None,
        };

        records.push(DetectionRecord::hand(frame.offset_ms, hand.present, hand.confidence));
        if let Some(codes) = codes {
            records.push(DetectionRecord::codes(frame.offset_ms, codes));
        }
    }

    if !frames.is_empty() && failed_frames == frames.len() {
        return Err(PackError::Detector(format!(
            "no frame of {} could be analysed",
            file_path.display()
        )));
    }

    log::debug!(
        "Sampled {}: {} frame(s), {} skipped, {} record(s)",
        file_path.display(),
        frames.len(),
        failed_frames,
        records.len()
    );
    Ok(records)
}
