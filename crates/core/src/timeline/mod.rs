use std::time::Duration;

use tokio::time::Instant;

use crate::Bpm;

/// A predicted beat on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatInstant {
    pub index: u64,
    pub at: Instant,
}

/// Beat grid anchored at a reference beat.
///
/// Beat `origin_index` sits at `origin`; every other beat is a whole number of
/// periods away from it. Retiming moves the anchor so that beats already
/// promised keep their instant.
#[derive(Debug, Clone)]
pub struct BeatClock {
    bpm: Bpm,
    origin: Instant,
    origin_index: u64,
}

impl BeatClock {
    pub fn new(bpm: Bpm, start: Instant) -> Self {
        Self {
            bpm,
            origin: start,
            origin_index: 0,
        }
    }

    pub fn bpm(&self) -> Bpm {
        self.bpm
    }

    pub fn period(&self) -> Duration {
        self.bpm.period()
    }

    /// Moves beat 0 to `start`, keeping the tempo.
    pub fn restart(&mut self, start: Instant) {
        self.origin = start;
        self.origin_index = 0;
    }

    /// Switches to `bpm` from `anchor_index` onwards. The anchor beat keeps the
    /// instant it had under the old tempo.
    pub fn retime(&mut self, bpm: Bpm, anchor_index: u64) {
        self.origin = self.beat_instant(anchor_index);
        self.origin_index = anchor_index;
        self.bpm = bpm;
    }

    pub fn beat_instant(&self, index: u64) -> Instant {
        let period = self.period().as_secs_f64();
        if index >= self.origin_index {
            let beats = (index - self.origin_index) as f64;
            self.origin + Duration::from_secs_f64(period * beats)
        } else {
            let beats = (self.origin_index - index) as f64;
            self.origin
                .checked_sub(Duration::from_secs_f64(period * beats))
                .unwrap_or(self.origin)
        }
    }

    /// Index of the first beat that falls at or after `t`, never earlier than
    /// the anchor beat.
    pub fn first_beat_at_or_after(&self, t: Instant) -> u64 {
        if t <= self.origin {
            return self.origin_index;
        }
        let elapsed = t.duration_since(self.origin).as_secs_f64();
        let beats = (elapsed / self.period().as_secs_f64() - 1e-9).ceil().max(0.0);
        self.origin_index + beats as u64
    }

    /// Lazy, unbounded sequence of beats starting at beat 0.
    pub fn beats(&self) -> Beats {
        self.beats_from(0)
    }

    pub fn beats_from(&self, index: u64) -> Beats {
        Beats {
            clock: self.clone(),
            next: index,
        }
    }
}

/// Iterator over the beats of a [`BeatClock`] snapshot.
#[derive(Debug, Clone)]
pub struct Beats {
    clock: BeatClock,
    next: u64,
}

impl Iterator for Beats {
    type Item = BeatInstant;

    fn next(&mut self) -> Option<BeatInstant> {
        let index = self.next;
        self.next += 1;
        Some(BeatInstant {
            index,
            at: self.clock.beat_instant(index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(bpm: f64) -> (BeatClock, Instant) {
        let start = Instant::now();
        (BeatClock::new(Bpm::new(bpm).unwrap(), start), start)
    }

    #[test]
    fn beats_are_strictly_increasing_and_evenly_spaced() {
        for bpm in [20.0, 60.0, 97.5, 120.0, 174.0, 300.0] {
            let (clock, _) = clock(bpm);
            let period = clock.period();
            let beats: Vec<_> = clock.beats().take(64).collect();

            for pair in beats.windows(2) {
                assert!(pair[1].at > pair[0].at);
                assert_eq!(pair[1].index, pair[0].index + 1);
                let gap = pair[1].at.duration_since(pair[0].at);
                let drift = gap.as_secs_f64() - period.as_secs_f64();
                assert!(drift.abs() < 1e-6, "{bpm} BPM drifted by {drift}");
            }
        }
    }

    #[test]
    fn retime_keeps_anchor_and_changes_later_spacing() {
        let (mut clock, start) = clock(120.0);
        let anchor = clock.beat_instant(3);
        assert_eq!(anchor, start + Duration::from_millis(1500));

        clock.retime(Bpm::new(60.0).unwrap(), 3);

        assert_eq!(clock.beat_instant(3), anchor);
        assert_eq!(clock.beat_instant(4), anchor + Duration::from_secs(1));
        assert_eq!(clock.beat_instant(2), start + Duration::from_millis(500));
    }

    #[test]
    fn first_beat_at_or_after_rounds_up() {
        let (clock, start) = clock(120.0);
        assert_eq!(clock.first_beat_at_or_after(start), 0);
        assert_eq!(clock.first_beat_at_or_after(start + Duration::from_millis(500)), 1);
        assert_eq!(clock.first_beat_at_or_after(start + Duration::from_millis(501)), 2);
    }

    #[test]
    fn restart_moves_beat_zero() {
        let (mut clock, start) = clock(120.0);
        clock.retime(Bpm::new(90.0).unwrap(), 10);
        let later = start + Duration::from_secs(30);
        clock.restart(later);

        let first = clock.beats().next().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.at, later);
        assert_eq!(clock.bpm(), Bpm::new(90.0).unwrap());
    }
}
