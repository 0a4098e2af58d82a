//! Time-window partitioning of a source.

use tracing::warn;

/// A contiguous `[start, end)` range of the source, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    /// 1-based position in the plan.
    pub index: usize,
    pub start: f64,
    pub duration: f64,
    pub end: f64,
}

impl Window {
    /// `HH:MM:SS - HH:MM:SS`, used to tag the window's text in the document.
    pub fn time_range(&self) -> String {
        format!(
            "{} - {}",
            seconds_to_timestamp(self.start),
            seconds_to_timestamp(self.end)
        )
    }
}

/// Computes the ordered windows covering `[0, total_duration)`.
///
/// Windows are at most `max_window` long and consecutive windows share `overlap`
/// seconds; the last one is clamped to end at `total_duration`. A non-positive
/// `max_window` disables splitting. An `overlap` that is negative or not shorter
/// than `max_window` is treated as zero.
pub fn plan(total_duration: f64, max_window: f64, overlap: f64) -> Vec<Window> {
    if !total_duration.is_finite() || total_duration <= 0.0 {
        return Vec::new();
    }
    if max_window <= 0.0 || total_duration <= max_window {
        return vec![Window {
            index: 1,
            start: 0.0,
            duration: total_duration,
            end: total_duration,
        }];
    }

    let overlap = if (0.0..max_window).contains(&overlap) {
        overlap
    } else {
        warn!(overlap, max_window, "overlap must be in [0, max_window); using 0");
        0.0
    };
    let step = max_window - overlap;

    let mut windows = Vec::new();
    let mut start = 0.0;
    while start < total_duration {
        let end = f64::min(start + max_window, total_duration);
        let duration = end - start;
        if duration > 0.0 {
            windows.push(Window {
                index: windows.len() + 1,
                start,
                duration,
                end,
            });
        }
        start += step;
    }
    windows
}

/// Formats seconds as `HH:MM:SS`, with a `.mmm` suffix only when the value has
/// a non-zero millisecond part.
pub fn seconds_to_timestamp(secs: f64) -> String {
    assert!(secs >= 0.0, "negative timestamp: {secs}");
    let millis = (secs * 1000.0).round() as u64;
    let (whole, ms) = (millis / 1000, millis % 1000);
    let h = whole / 3600;
    let m = (whole % 3600) / 60;
    let s = whole % 60;
    if ms == 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}.{ms:03}")
    }
}
