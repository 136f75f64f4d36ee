// Splitting of over-long runs into bounded pieces

use crate::config::SplitPolicy;

/// Offsets (ms from file start) of one piece of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

impl Span {
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

/// A closed run of hand activity.
#[derive(Debug, Clone, Default)]
pub struct Run {
    pub start: i64,
    /// Last hand-present frame.
    pub end: i64,
    /// Hand-present frame offsets, ascending.
    pub present: Vec<i64>,
    /// Hand-absent frame offsets strictly inside the run, ascending.
    pub absent: Vec<i64>,
}

/// Cut `run` so no piece is longer than `max_ms`.
///
/// A tail shorter than `min_ms` is merged with the piece before it and the
/// two are cut again at their midpoint, which puts both within
/// `[min_ms, max_ms]` whenever `max_ms >= 2 * min_ms`. Any piece still
/// shorter than `min_ms` is returned; the caller drops it.
pub fn split_run(run: &Run, policy: SplitPolicy, min_ms: i64, max_ms: i64) -> Vec<Span> {
    let max_ms = max_ms.max(1);
    let mut spans = match policy {
        SplitPolicy::FixedBoundary => split_fixed(run.start, run.end, max_ms),
        SplitPolicy::NaturalGap => split_natural(run, min_ms, max_ms),
    };
    rebalance_tail(&mut spans, min_ms, max_ms);
    spans
}

fn rebalance_tail(spans: &mut [Span], min_ms: i64, max_ms: i64) {
    let [.., prev, last] = spans else {
        return;
    };
    if last.duration() >= min_ms {
        return;
    }

    let mid = prev.start + (last.end - prev.start) / 2;
    let first = Span { start: prev.start, end: mid };
    let second = Span { start: mid, end: last.end };
    let fits = |s: &Span| s.duration() >= min_ms && s.duration() <= max_ms;
    if fits(&first) && fits(&second) {
        *prev = first;
        *last = second;
    }
}

fn split_fixed(start: i64, end: i64, max_ms: i64) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut s = start;
    while end - s > max_ms {
        spans.push(Span { start: s, end: s + max_ms });
        s += max_ms;
    }
    spans.push(Span { start: s, end });
    spans
}

/// Prefer cutting at the latest hand-absent frame that keeps the piece
/// within `[min_ms, max_ms]`; otherwise cut at the fixed boundary.
fn split_natural(run: &Run, min_ms: i64, max_ms: i64) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut s = run.start;

    while run.end - s > max_ms {
        let limit = s + max_ms;
        let cut = run
            .absent
            .iter()
            .rev()
            .copied()
            .filter(|&a| a > s && a <= limit)
            .find_map(|gap| {
                let before = run.present.partition_point(|&p| p < gap);
                let after = run.present.partition_point(|&p| p <= gap);
                let end = *run.present.get(before.checked_sub(1)?)?;
                let next = *run.present.get(after)?;
                (end >= s && end - s >= min_ms).then_some((end, next))
            });

        match cut {
            Some((end, next)) => {
                spans.push(Span { start: s, end });
                s = next;
            }
            None => {
                spans.push(Span { start: s, end: limit });
                s = limit;
            }
        }
    }

    spans.push(Span { start: s, end: run.end });
    spans
}
