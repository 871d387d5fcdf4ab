use std::{collections::VecDeque, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{config::TempoConfig, BeatLightError, Result};

/// Beats per minute. Always positive and finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Bpm(f64);

impl Bpm {
    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(BeatLightError::invalid_tempo(format!(
                "{value} is not a positive tempo"
            )))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Time between two beats.
    pub fn period(self) -> Duration {
        Duration::from_secs_f64(60.0 / self.0)
    }
}

impl fmt::Display for Bpm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} BPM", self.0)
    }
}

/// Inclusive range of tempos the scheduler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoRange {
    pub min: f64,
    pub max: f64,
}

impl Default for TempoRange {
    fn default() -> Self {
        Self {
            min: 20.0,
            max: 300.0,
        }
    }
}

impl TempoRange {
    pub fn validate(&self, value: f64) -> Result<Bpm> {
        let bpm = Bpm::new(value)?;
        if value < self.min || value > self.max {
            return Err(BeatLightError::invalid_tempo(format!(
                "{value:.1} BPM is outside {:.0}-{:.0}",
                self.min, self.max
            )));
        }
        Ok(bpm)
    }
}

/// Derives a tempo from tap timestamps.
///
/// Inter-tap intervals are compared against their median; anything further
/// than `tolerance` (a fraction, e.g. `0.3` for ±30%) from it is treated as a
/// mis-tap and dropped before averaging.
pub fn bpm_from_taps(taps: &[Instant], tolerance: f64, range: &TempoRange) -> Result<Bpm> {
    if taps.len() < 2 {
        return Err(BeatLightError::invalid_tempo(
            "at least two taps are required",
        ));
    }

    let mut intervals = Vec::with_capacity(taps.len() - 1);
    for window in taps.windows(2) {
        if window[1] <= window[0] {
            return Err(BeatLightError::invalid_tempo("taps must be increasing"));
        }
        intervals.push(window[1].duration_since(window[0]).as_secs_f64());
    }

    let reference = median(&intervals);
    let mut sum = 0.0;
    let mut count = 0;
    for interval in &intervals {
        if (interval - reference).abs() <= reference * tolerance {
            sum += interval;
            count += 1;
        }
    }

    // The median itself always lies inside the window, so `count` is only
    // zero when every interval is degenerate.
    if count == 0 {
        return Err(BeatLightError::invalid_tempo("no consistent tap intervals"));
    }

    range.validate(60.0 / (sum / count as f64))
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    } else {
        sorted[mid]
    }
}

/// Rolling tap history for tap-tempo input.
#[derive(Debug, Clone)]
pub struct TapTempo {
    taps: VecDeque<Instant>,
    history: usize,
    reset_after: Duration,
    tolerance: f64,
    range: TempoRange,
}

impl TapTempo {
    pub fn new(config: &TempoConfig) -> Self {
        Self {
            taps: VecDeque::with_capacity(config.tap_history),
            history: config.tap_history.max(2),
            reset_after: config.tap_reset(),
            tolerance: config.tap_tolerance,
            range: config.range(),
        }
    }

    /// Registers a tap. Returns `Ok(None)` while fewer than two taps are
    /// available. A pause longer than the reset gap starts a new sequence.
    pub fn tap(&mut self, at: Instant) -> Result<Option<Bpm>> {
        if let Some(&last) = self.taps.back() {
            if at < last {
                return Err(BeatLightError::invalid_tempo(
                    "tap arrived before the previous one",
                ));
            }
            if at.duration_since(last) > self.reset_after {
                self.taps.clear();
            }
        }

        self.taps.push_back(at);
        while self.taps.len() > self.history {
            self.taps.pop_front();
        }

        if self.taps.len() < 2 {
            return Ok(None);
        }

        bpm_from_taps(self.taps.make_contiguous(), self.tolerance, &self.range).map(Some)
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn reset(&mut self) {
        self.taps.clear();
    }
}
