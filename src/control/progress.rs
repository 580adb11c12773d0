//! Moving-average throughput, ETA and the progress bar.

use crate::config::UNBOUNDED;
use crate::pipeline::SourceProgress;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of refresh samples in the moving average.
pub const SAMPLE_WINDOW: usize = 10;

const MB: f64 = 1024.0 * 1024.0;

/// Completion percentage of a run.
///
/// A bounded record count is measured in processed records (capped by the
/// entries left after skipping, when known). Otherwise bytes read over total
/// bytes, and failing that the source position over its entry count.
pub fn progress_percent(
    record_limit: u64,
    processed: u64,
    skipped: u64,
    source: &SourceProgress,
) -> f64 {
    let ratio = |done: u64, total: u64| {
        if total == 0 {
            0.0
        } else {
            (done as f64 / total as f64 * 100.0).min(100.0)
        }
    };

    if record_limit != UNBOUNDED {
        let target = match source.entries {
            Some(entries) => record_limit.min(entries.saturating_sub(skipped)),
            None => record_limit,
        };
        return ratio(processed, target);
    }
    match (source.total_bytes, source.entries) {
        (Some(total), _) if total > 0 => ratio(source.bytes_read, total),
        (_, Some(entries)) => ratio(source.position, entries),
        _ => 0.0,
    }
}

/// `=====>-----` style bar of `width` characters.
pub fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((percent / 100.0) * width as f64).floor().clamp(0.0, width as f64) as usize;
    let mut bar = String::with_capacity(width);
    bar.extend(std::iter::repeat('=').take(filled));
    if filled < width {
        bar.push('>');
        bar.extend(std::iter::repeat('-').take(width - filled - 1));
    }
    bar
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: u64,
    percent: f64,
    elapsed: Duration,
}

/// One refreshed progress figure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub percent: f64,
    pub processed: u64,
    pub mb_per_sec: f64,
    /// `None` until progress has actually moved.
    pub eta_minutes: Option<f64>,
}

impl ProgressReport {
    /// Single status line with a bar of `bar_width` characters.
    pub fn render(&self, bar_width: usize, pause_hint: &str) -> String {
        let eta = match self.eta_minutes {
            Some(minutes) => format!("{:.1} min ETA", minutes),
            None => "-- min ETA".to_string(),
        };
        format!(
            "{} records ({:.1}MB/s), {}, {} {:.1}%[{}]",
            self.processed,
            self.mb_per_sec,
            eta,
            pause_hint,
            self.percent,
            progress_bar(self.percent, bar_width)
        )
    }
}

/// Ring buffer of the last [`SAMPLE_WINDOW`] refresh deltas.
#[derive(Debug)]
pub struct ProgressEstimator {
    samples: VecDeque<Sample>,
    last_bytes: u64,
    last_percent: f64,
    last_at: Instant,
}

impl ProgressEstimator {
    pub fn new(now: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            last_bytes: 0,
            last_percent: 0.0,
            last_at: now,
        }
    }

    /// Take a sample and return the smoothed figures.
    pub fn update(
        &mut self,
        bytes_read: u64,
        percent: f64,
        processed: u64,
        now: Instant,
    ) -> ProgressReport {
        let sample = Sample {
            bytes: bytes_read.saturating_sub(self.last_bytes),
            percent: (percent - self.last_percent).max(0.0),
            elapsed: now.saturating_duration_since(self.last_at),
        };
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last_bytes = bytes_read;
        self.last_percent = percent;
        self.last_at = now;

        let secs: f64 = self.samples.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        let bytes: u64 = self.samples.iter().map(|s| s.bytes).sum();
        let moved: f64 = self.samples.iter().map(|s| s.percent).sum();

        let mb_per_sec = if secs > 0.0 { bytes as f64 / MB / secs } else { 0.0 };
        let eta_minutes = if secs > 0.0 && moved > 0.0 {
            Some((100.0 - percent).max(0.0) / (moved / secs) / 60.0)
        } else {
            None
        };

        ProgressReport {
            percent,
            processed,
            mb_per_sec,
            eta_minutes,
        }
    }
}
