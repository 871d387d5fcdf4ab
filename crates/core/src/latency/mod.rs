use std::{collections::VecDeque, fmt, time::Duration};

use serde::Serialize;

use crate::config::LatencyConfig;

/// Tracks how long device calls take and turns that into a lead time.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    samples: VecDeque<Duration>,
    window: usize,
    percentile: f64,
    outlier_factor: f64,
    failures: u64,
}

impl LatencyEstimator {
    pub fn new(config: &LatencyConfig) -> Self {
        let window = config.window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            percentile: config.percentile.clamp(f64::EPSILON, 1.0),
            outlier_factor: config.outlier_factor.max(1.0),
            failures: 0,
        }
    }

    /// Appends one completed call, evicting the oldest beyond the window.
    pub fn record(&mut self, elapsed: Duration) {
        self.samples.push_back(elapsed);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Failed calls carry no usable timing and are only counted.
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// How early a command must leave so it lands on the beat. Always within
    /// `[0, period]`.
    pub fn compensation(&self, period: Duration) -> Duration {
        let usable = self.usable_samples();
        if usable.is_empty() {
            return Duration::ZERO;
        }

        // nearest-rank percentile
        let rank = (self.percentile * usable.len() as f64 - 1e-9).ceil() as usize;
        let index = rank.clamp(1, usable.len()) - 1;
        usable[index].min(period)
    }

    pub fn stats(&self) -> LatencyStats {
        let outliers = self.samples.len() - self.usable_samples().len();
        let (min, max) = match (self.samples.iter().min(), self.samples.iter().max()) {
            (Some(min), Some(max)) => (Some(*min), Some(*max)),
            _ => (None, None),
        };
        let mean = if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<Duration>() / self.samples.len() as u32)
        };

        LatencyStats {
            samples: self.samples.len(),
            mean,
            min,
            max,
            failures: self.failures,
            outliers,
        }
    }

    /// Samples sorted ascending with spikes above `outlier_factor * median`
    /// removed.
    fn usable_samples(&self) -> Vec<Duration> {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let Some(median) = sorted.get(sorted.len() / 2).copied() else {
            return sorted;
        };

        let ceiling = median.mul_f64(self.outlier_factor);
        sorted.retain(|sample| *sample <= ceiling);
        sorted
    }
}

/// Snapshot of the measurements currently held by a [`LatencyEstimator`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub mean: Option<Duration>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub failures: u64,
    pub outliers: usize,
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |value: Option<Duration>| value.unwrap_or_default().as_secs_f64() * 1000.0;
        if self.samples == 0 {
            return write!(f, "no latency data yet ({} failed calls)", self.failures);
        }
        write!(
            f,
            "latency: avg={:.1}ms, min={:.1}ms, max={:.1}ms ({} samples, {} outliers, {} failed calls)",
            ms(self.mean),
            ms(self.min),
            ms(self.max),
            self.samples,
            self.outliers,
            self.failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn estimator() -> LatencyEstimator {
        LatencyEstimator::new(&LatencyConfig::default())
    }

    #[test]
    fn empty_estimator_does_not_compensate() {
        assert_eq!(estimator().compensation(ms(500)), Duration::ZERO);
    }

    #[test]
    fn uses_upper_percentile_of_recent_calls() {
        let mut latency = estimator();
        for value in 1..=10 {
            latency.record(ms(value * 10));
        }
        assert_eq!(latency.compensation(ms(500)), ms(90));
    }

    #[test]
    fn single_spike_is_excluded() {
        let mut latency = estimator();
        for _ in 0..9 {
            latency.record(ms(20));
        }
        latency.record(ms(900));

        assert_eq!(latency.compensation(ms(500)), ms(20));
        assert_eq!(latency.stats().outliers, 1);
    }

    #[test]
    fn compensation_never_exceeds_a_beat() {
        let mut latency = estimator();
        for _ in 0..5 {
            latency.record(ms(800));
        }
        for period in [ms(200), ms(500), ms(3000)] {
            let offset = latency.compensation(period);
            assert!(offset <= period);
        }
        assert_eq!(latency.compensation(ms(200)), ms(200));
    }

    #[test]
    fn window_evicts_oldest_samples() {
        let mut latency = LatencyEstimator::new(&LatencyConfig {
            window: 3,
            ..LatencyConfig::default()
        });
        for value in [100, 10, 10, 10] {
            latency.record(ms(value));
        }
        let stats = latency.stats();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.max, Some(ms(10)));
    }

    #[test]
    fn failures_are_counted_without_samples() {
        let mut latency = estimator();
        latency.record_failure();
        latency.record(ms(30));

        let stats = latency.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.mean, Some(ms(30)));
        assert!(stats.to_string().contains("avg=30.0ms"));
    }
}
