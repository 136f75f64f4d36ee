// Event correlator
//
// Per-file state machine over the detection stream (idle -> active -> idle).
// A run opens on the first hand-present frame in the packing zone and closes
// once the hand has been absent for the stability window, or the file ends.
// Closed runs are bounded by [min, max] packing time: short runs are noise,
// long runs are split.

pub mod split;

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::CanonicalTime;
use crate::config::{ScanMode, SchedulerConfig, SplitPolicy};
use crate::error::Result;
use crate::sampler::{DetectionRecord, Observation};
use split::{split_run, Run, Span};

/// A bounded span of packing activity, in canonical time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingEvent {
    pub camera_id: String,
    pub source_path: String,
    pub start: CanonicalTime,
    pub end: CanonicalTime,
    pub duration_ms: i64,
    pub tracking_codes: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub min_packing_ms: i64,
    pub max_packing_ms: i64,
    pub stability_window_ms: i64,
    pub scan_mode: ScanMode,
    pub split_policy: SplitPolicy,
    pub code_pattern: Option<Regex>,
}

impl CorrelatorSettings {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            min_packing_ms: config.min_packing_ms(),
            max_packing_ms: config.max_packing_ms(),
            stability_window_ms: config.stability_window_ms as i64,
            scan_mode: config.scan_mode,
            split_policy: config.split_policy,
            code_pattern: config.tracking_code_regex()?,
        })
    }

    /// Trimmed code if it is non-empty and matches the pattern.
    fn accept_code(&self, raw: &str) -> Option<String> {
        let code = raw.trim();
        if code.is_empty() {
            return None;
        }
        match self.code_pattern {
            Some(ref re) if !re.is_match(code) => None,
            _ => Some(code.to_string()),
        }
    }
}

/// Where a file sits in canonical time, and what events are attributed to.
#[derive(Debug, Clone)]
pub struct FileContext {
    pub camera_id: String,
    pub source_path: String,
    /// Canonical creation time of the file; frame offsets are added to it.
    pub file_start: CanonicalTime,
}

#[derive(Debug, Default)]
struct ActiveRun {
    run: Run,
    /// Absent frames since the last present frame; moved into the run if
    /// the hand comes back.
    pending_absent: Vec<i64>,
    codes: Vec<(i64, String)>,
}

/// Streaming correlator for one file. Feed records in frame order.
#[derive(Debug)]
pub struct Correlator<'a> {
    settings: &'a CorrelatorSettings,
    ctx: &'a FileContext,
    active: Option<ActiveRun>,
    last_frame_ms: Option<i64>,
    events: Vec<PackingEvent>,
}

impl<'a> Correlator<'a> {
    pub fn new(settings: &'a CorrelatorSettings, ctx: &'a FileContext) -> Self {
        Self {
            settings,
            ctx,
            active: None,
            last_frame_ms: None,
            events: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn feed(&mut self, record: &DetectionRecord) {
        let t = record.frame_ms;
        if let Some(last) = self.last_frame_ms {
            if t < last {
                log::warn!("Out-of-order detection at {}ms in {} ignored", t, self.ctx.source_path);
                return;
            }
        }
        self.last_frame_ms = Some(t);

        match &record.observation {
            Observation::Hand(true) => match self.active.as_mut() {
                Some(active) => {
                    let gap = std::mem::take(&mut active.pending_absent);
                    active.run.absent.extend(gap);
                    active.run.end = t;
                    active.run.present.push(t);
                }
                None => {
                    self.active = Some(ActiveRun {
                        run: Run {
                            start: t,
                            end: t,
                            present: vec![t],
                            absent: Vec::new(),
                        },
                        ..Default::default()
                    });
                }
            },
            Observation::Hand(false) => {
                let close = match self.active.as_mut() {
                    Some(active) => {
                        active.pending_absent.push(t);
                        t - active.run.end >= self.settings.stability_window_ms
                    }
                    None => false,
                };
                if close {
                    self.close();
                }
            }
            Observation::Codes(codes) => {
                if let Some(active) = self.active.as_mut() {
                    for raw in codes {
                        if let Some(code) = self.settings.accept_code(raw) {
                            active.codes.push((t, code));
                        }
                    }
                }
            }
        }
    }

    /// Close any open run at end of file and return the events.
    pub fn finish(mut self) -> Vec<PackingEvent> {
        self.close();
        self.events
    }

    fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let run = active.run;
        let duration = run.end - run.start;
        if duration < self.settings.min_packing_ms {
            log::debug!(
                "Discarding {}ms of hand activity at {}ms in {} (below minimum)",
                duration,
                run.start,
                self.ctx.source_path
            );
            return;
        }

        let spans = split_run(&run, self.settings.split_policy, self.settings.min_packing_ms, self.settings.max_packing_ms);
        if spans.len() > 1 {
            log::debug!("Split {}ms run in {} into {} piece(s)", duration, self.ctx.source_path, spans.len());
        }

        let mut codes: Vec<BTreeSet<String>> = vec![BTreeSet::new(); spans.len()];
        for (t, code) in active.codes {
            // Last piece starting at or before the observation; grace-period
            // codes land in the final piece
            let idx = spans.partition_point(|s| s.start <= t).saturating_sub(1);
            codes[idx].insert(code);
        }

        for (span, codes) in spans.into_iter().zip(codes) {
            if let Some(event) = self.build_event(span, codes) {
                self.events.push(event);
            }
        }
    }

    fn build_event(&self, span: Span, codes: BTreeSet<String>) -> Option<PackingEvent> {
        let duration = span.duration();
        if duration < self.settings.min_packing_ms || duration > self.settings.max_packing_ms {
            return None;
        }
        if self.settings.scan_mode.requires_code() && codes.is_empty() {
            log::debug!("Dropping event at {}ms in {}: no tracking code", span.start, self.ctx.source_path);
            return None;
        }
        Some(PackingEvent {
            camera_id: self.ctx.camera_id.clone(),
            source_path: self.ctx.source_path.clone(),
            start: self.ctx.file_start.plus_millis(span.start),
            end: self.ctx.file_start.plus_millis(span.end),
            duration_ms: duration,
            tracking_codes: codes,
        })
    }
}

/// Correlate a whole detection log. Records are put in frame order first.
pub fn correlate(records: &[DetectionRecord], settings: &CorrelatorSettings, ctx: &FileContext) -> Vec<PackingEvent> {
    let mut ordered: Vec<&DetectionRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.frame_ms);

    let mut correlator = Correlator::new(settings, ctx);
    for record in ordered {
        correlator.feed(record);
    }
    correlator.finish()
}
