use std::time::Duration;

use hdrhistogram::Histogram;

/// Bounded-memory quantile sketch over segment wall-times (or, reused by the
/// aggregator, client uptimes). Backed by `hdrhistogram`, tracking
/// microsecond resolution up to one hour with three significant digits.
#[derive(Debug, Clone)]
pub struct LatencyDigest {
    histogram: Histogram<u64>,
}

const MAX_TRACKABLE_MICROS: u64 = Duration::from_secs(3600).as_micros() as u64;
const SIGNIFICANT_DIGITS: u8 = 3;

impl LatencyDigest {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_TRACKABLE_MICROS, SIGNIFICANT_DIGITS)
                .expect("hardcoded histogram bounds are valid"),
        }
    }

    pub fn record(&mut self, value: Duration) {
        let micros = value.as_micros().min(MAX_TRACKABLE_MICROS as u128) as u64;
        // saturating_record never returns an error; out-of-range values clamp.
        self.histogram.saturating_record(micros.max(1));
    }

    pub fn merge(&mut self, other: &LatencyDigest) {
        self.histogram += &other.histogram;
    }

    pub fn percentiles(&self) -> Percentiles {
        Percentiles {
            p25: micros_to_duration(self.histogram.value_at_quantile(0.25)),
            p50: micros_to_duration(self.histogram.value_at_quantile(0.50)),
            p75: micros_to_duration(self.histogram.value_at_quantile(0.75)),
            p95: micros_to_duration(self.histogram.value_at_quantile(0.95)),
            p99: micros_to_duration(self.histogram.value_at_quantile(0.99)),
            min: micros_to_duration(self.histogram.min()),
            max: micros_to_duration(self.histogram.max()),
            count: self.histogram.len(),
        }
    }
}

impl Default for LatencyDigest {
    fn default() -> Self {
        Self::new()
    }
}

fn micros_to_duration(micros: u64) -> Duration {
    Duration::from_micros(micros)
}

/// Percentile readout from a [`LatencyDigest`], accurate to within the
/// histogram's configured significant-digit precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentiles {
    pub p25: Duration,
    pub p50: Duration,
    pub p75: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub min: Duration,
    pub max: Duration,
    pub count: u64,
}
