// Canonical time
//
// All stored or compared timestamps pass through `to_canonical`. The canonical
// timezone is UTC and values are persisted as epoch milliseconds. Nothing else
// in the crate reads the wall clock directly; it goes through a `Clock`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A point in time in the canonical timezone, as UTC epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalTime(i64);

impl CanonicalTime {
    pub fn from_millis(ms: i64) -> Self {
        CanonicalTime(ms)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn to_utc(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0).single().unwrap_or_default()
    }

    /// View this instant as wall-clock time at a site.
    pub fn in_zone(self, tz: Tz) -> DateTime<Tz> {
        self.to_utc().with_timezone(&tz)
    }

    pub fn plus_millis(self, ms: i64) -> Self {
        CanonicalTime(self.0.saturating_add(ms))
    }

    pub fn minus_secs(self, secs: i64) -> Self {
        CanonicalTime(self.0.saturating_sub(secs.saturating_mul(1000)))
    }

    /// Local midnight (in `tz`) of the day containing this instant.
    pub fn start_of_local_day(self, tz: Tz) -> Self {
        let date = self.in_zone(tz).date_naive();
        local_midnight(date, tz)
    }

    pub fn to_rfc3339(self) -> String {
        self.to_utc().to_rfc3339()
    }
}

impl std::fmt::Display for CanonicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_utc().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

/// A timestamp as read from a source, before normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceTime {
    /// Carries its own offset (RFC 3339 with `Z` or `+07:00`).
    Zoned(DateTime<FixedOffset>),
    /// Wall-clock time without an offset; interpreted in the source timezone.
    Local(NaiveDateTime),
    /// Filesystem time.
    System(SystemTime),
}

/// Normalize a source timestamp to the canonical timezone.
///
/// Offset-less wall-clock values are resolved in `source_tz`. An ambiguous
/// local time (DST fall-back) resolves to the earlier instant; a local time
/// inside a DST gap is shifted forward by the gap.
pub fn to_canonical(ts: SourceTime, source_tz: Tz) -> CanonicalTime {
    let utc: DateTime<Utc> = match ts {
        SourceTime::Zoned(dt) => dt.with_timezone(&Utc),
        SourceTime::System(st) => DateTime::<Utc>::from(st),
        SourceTime::Local(naive) => match source_tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
            LocalResult::None => {
                // Read with the offset in force before the gap, which lands
                // the instant past it by the gap's actual width
                let before = source_tz
                    .offset_from_utc_datetime(&(naive - chrono::Duration::days(1)))
                    .fix();
                (naive - chrono::Duration::seconds(i64::from(before.local_minus_utc()))).and_utc()
            }
        },
    };
    CanonicalTime(utc.timestamp_millis())
}

fn local_midnight(date: NaiveDate, tz: Tz) -> CanonicalTime {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    to_canonical(SourceTime::Local(naive), tz)
}

/// Outcome of reading a file's creation time. Callers must handle the
/// degraded cases explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum CreationTime {
    /// Read from the file's own metadata.
    Metadata(CanonicalTime),
    /// Metadata was unusable; filesystem mtime was used instead.
    FallbackUsed { time: CanonicalTime, reason: String },
    /// Neither source produced a timestamp.
    Unavailable { reason: String },
}

impl CreationTime {
    pub fn time(&self) -> Option<CanonicalTime> {
        match self {
            CreationTime::Metadata(t) => Some(*t),
            CreationTime::FallbackUsed { time, .. } => Some(*time),
            CreationTime::Unavailable { .. } => None,
        }
    }

    /// Value stored in `file_jobs.created_at_source`.
    pub fn source_label(&self) -> &'static str {
        match self {
            CreationTime::Metadata(_) => "metadata",
            CreationTime::FallbackUsed { .. } | CreationTime::Unavailable { .. } => "filesystem",
        }
    }
}

/// Parse a timestamp string as written by ffprobe, exiftool or a user.
///
/// Accepted: RFC 3339 (`2024-03-10T02:00:00.000000Z`), `YYYY-MM-DD HH:MM:SS`,
/// and exif style `YYYY:MM:DD HH:MM:SS` with optional `+HH:MM` suffix.
pub fn parse_source_time(raw: &str) -> Option<SourceTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(SourceTime::Zoned(dt));
    }

    for fmt in ["%Y:%m:%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(SourceTime::Zoned(dt));
        }
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y:%m:%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(SourceTime::Local(naive));
        }
    }

    None
}

/// Parse a user-supplied bound (`2024-03-10` or a full timestamp) in the site timezone.
pub fn parse_user_time(raw: &str, tz: Tz) -> Option<CanonicalTime> {
    if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        return Some(local_midnight(date, tz));
    }
    parse_source_time(raw).map(|ts| to_canonical(ts, tz))
}

/// Source of "now". Injected everywhere a component needs the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> CanonicalTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> CanonicalTime {
        to_canonical(SourceTime::System(SystemTime::now()), Tz::UTC)
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: CanonicalTime) -> Self {
        Self { ms: AtomicI64::new(start.millis()) }
    }

    pub fn set(&self, t: CanonicalTime) {
        self.ms.store(t.millis(), Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.ms.fetch_add(secs * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> CanonicalTime {
        CanonicalTime(self.ms.load(Ordering::SeqCst))
    }
}
