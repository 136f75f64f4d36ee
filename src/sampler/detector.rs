// External detector program
//
// Protocol, one process per call:
//   <program> hand <frame.jpg> <x> <y> <width> <height>  ->  {"present": bool, "confidence": 0.93}
//   <program> qr   <frame.jpg> <x> <y> <width> <height>  ->  {"codes": ["..."]}
// A non-zero exit is a per-frame failure. A call that outlives the timeout
// is killed and reported as DetectorTimeout.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::Zone;
use crate::constants::DETECTOR_TIMEOUT_SECS;
use crate::error::{PackError, Result};
use super::{Frame, HandDetector, HandReading, QrDecoder};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Deserialize)]
struct HandReply {
    present: bool,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct QrReply {
    #[serde(default)]
    codes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            timeout: Duration::from_secs(DETECTOR_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn call(&self, kind: &str, frame: &Frame, zone: &Zone) -> Result<String> {
        let child = Command::new(&self.program)
            .arg(kind)
            .arg(&frame.path)
            .args([
                zone.x.to_string(),
                zone.y.to_string(),
                zone.width.to_string(),
                zone.height.to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PackError::Detector(format!("Failed to start {}: {}", self.program.display(), e)))?;

        self.wait(child, kind)
    }

    fn wait(&self, mut child: Child, kind: &str) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PackError::DetectorTimeout(format!(
                    "{} detector exceeded {}s",
                    kind,
                    self.timeout.as_secs()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)?;
        }
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }
            return Err(PackError::Detector(format!("{} detector failed: {}", kind, stderr.trim())));
        }
        Ok(stdout)
    }
}

fn parse_hand(stdout: &str) -> Result<HandReading> {
    let reply: HandReply = serde_json::from_str(stdout.trim())
        .map_err(|e| PackError::Detector(format!("bad hand detector reply: {}", e)))?;
    Ok(HandReading {
        present: reply.present,
        confidence: reply.confidence,
    })
}

fn parse_qr(stdout: &str) -> Result<Vec<String>> {
    let reply: QrReply = serde_json::from_str(stdout.trim())
        .map_err(|e| PackError::Detector(format!("bad qr decoder reply: {}", e)))?;
    Ok(reply.codes)
}

impl HandDetector for CommandDetector {
    fn detect_hand_presence(&self, frame: &Frame, zone: &Zone) -> Result<HandReading> {
        parse_hand(&self.call("hand", frame, zone)?)
    }
}

impl QrDecoder for CommandDetector {
    fn decode_qr(&self, frame: &Frame, zone: &Zone) -> Result<Vec<String>> {
        parse_qr(&self.call("qr", frame, zone)?)
    }
}
