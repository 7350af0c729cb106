//! Running statistics over the sample stream.
//!
//! The aggregate is the one piece of state mutated by both engines, so all
//! updates funnel through a mutex. Mean is maintained as running sum and
//! count: O(1) per sample and O(1) memory beyond the bin array, never
//! recomputed from history.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::sample::{Direction, LatencySample, ThroughputSample};

/// Thread-safe accumulator for latency and throughput statistics.
pub struct Aggregate {
    state: Mutex<AggregateState>,
}

struct AggregateState {
    count: u64,
    lost: u64,
    sum_ms: f64,
    // min/max start at the identity elements so the first sample always wins
    min_ms: f64,
    max_ms: f64,
    idle_count: u64,
    idle_sum_ms: f64,
    loaded_count: u64,
    loaded_sum_ms: f64,
    bin_width_ms: f64,
    bins: Vec<u64>,
    download: DirectionStats,
    upload: DirectionStats,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct DirectionStats {
    samples: u64,
    last_bps: f64,
    peak_bps: f64,
}

/// Point-in-time copy of the aggregate, safe to take while recording goes on.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    /// Completed latency samples recorded so far.
    pub count: u64,
    /// Probes marked lost; these never contribute to the other fields.
    pub lost: u64,
    /// Mean round-trip time in milliseconds, `None` until a sample arrives.
    pub mean_ms: Option<f64>,
    /// Smallest round trip seen.
    pub min_ms: Option<f64>,
    /// Largest round trip seen.
    pub max_ms: Option<f64>,
    /// Mean round trip of samples taken with no stream run active.
    pub idle_mean_ms: Option<f64>,
    /// Mean round trip of samples taken while a stream run was active.
    pub loaded_mean_ms: Option<f64>,
    /// Width of one histogram bin in milliseconds.
    pub bin_width_ms: f64,
    /// Histogram of round-trip times; the last bin also holds everything
    /// beyond the configured range.
    pub bins: Vec<u64>,
    /// Download throughput seen so far.
    pub download: Option<ThroughputSummary>,
    /// Upload throughput seen so far.
    pub upload: Option<ThroughputSummary>,
}

/// Per-direction throughput summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThroughputSummary {
    /// Number of completed runs in this direction.
    pub samples: u64,
    /// Throughput of the most recent run, bits per second.
    pub last_bps: f64,
    /// Best run observed, bits per second.
    pub peak_bps: f64,
}

impl Aggregate {
    /// Create an aggregate with `bin_count` histogram bins of
    /// `bin_width_ms` milliseconds each.
    pub fn new(bin_width_ms: f64, bin_count: usize) -> Self {
        Aggregate {
            state: Mutex::new(AggregateState {
                count: 0,
                lost: 0,
                sum_ms: 0.0,
                min_ms: f64::INFINITY,
                max_ms: f64::NEG_INFINITY,
                idle_count: 0,
                idle_sum_ms: 0.0,
                loaded_count: 0,
                loaded_sum_ms: 0.0,
                bin_width_ms,
                bins: vec![0; bin_count.max(1)],
                download: DirectionStats::default(),
                upload: DirectionStats::default(),
            }),
        }
    }

    /// Fold one completed latency sample into the running statistics.
    pub fn record_latency(&self, sample: &LatencySample) {
        let ms = sample.round_trip_ms();
        let mut s = self.state.lock().unwrap();
        s.count += 1;
        s.sum_ms += ms;
        s.min_ms = s.min_ms.min(ms);
        s.max_ms = s.max_ms.max(ms);
        if sample.under_load {
            s.loaded_count += 1;
            s.loaded_sum_ms += ms;
        } else {
            s.idle_count += 1;
            s.idle_sum_ms += ms;
        }
        let last = s.bins.len() - 1;
        let idx = ((ms / s.bin_width_ms).floor() as usize).min(last);
        s.bins[idx] += 1;
    }

    /// Count a probe that timed out. Lost probes stay out of every other
    /// statistic.
    pub fn record_lost(&self) {
        self.state.lock().unwrap().lost += 1;
    }

    /// Fold one completed throughput run into the running statistics.
    pub fn record_throughput(&self, sample: &ThroughputSample) {
        let bps = sample.bits_per_second();
        let mut s = self.state.lock().unwrap();
        let stats = match sample.direction {
            Direction::Download => &mut s.download,
            Direction::Upload => &mut s.upload,
        };
        stats.samples += 1;
        stats.last_bps = bps;
        stats.peak_bps = stats.peak_bps.max(bps);
    }

    /// Read-only copy of the current state.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let s = self.state.lock().unwrap();
        let mean = |sum: f64, count: u64| (count > 0).then(|| sum / count as f64);
        AggregateSnapshot {
            count: s.count,
            lost: s.lost,
            mean_ms: mean(s.sum_ms, s.count),
            min_ms: (s.count > 0).then_some(s.min_ms),
            max_ms: (s.count > 0).then_some(s.max_ms),
            idle_mean_ms: mean(s.idle_sum_ms, s.idle_count),
            loaded_mean_ms: mean(s.loaded_sum_ms, s.loaded_count),
            bin_width_ms: s.bin_width_ms,
            bins: s.bins.clone(),
            download: summary(&s.download),
            upload: summary(&s.upload),
        }
    }
}

fn summary(stats: &DirectionStats) -> Option<ThroughputSummary> {
    (stats.samples > 0).then_some(ThroughputSummary {
        samples: stats.samples,
        last_bps: stats.last_bps,
        peak_bps: stats.peak_bps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Direction;

    fn latency(ms: u64, under_load: bool) -> LatencySample {
        LatencySample {
            round_trip: Duration::from_millis(ms),
            responder_processing: Duration::ZERO,
            one_way: Duration::from_millis(ms / 2),
            under_load,
        }
    }

    #[test]
    fn mean_min_max_and_bin_total() {
        let agg = Aggregate::new(2.0, 16);
        let values = [1u64, 3, 5, 7, 9];
        for v in values {
            agg.record_latency(&latency(v, false));
        }

        let snap = agg.snapshot();
        assert_eq!(snap.count, 5);
        assert!((snap.mean_ms.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(snap.min_ms, Some(1.0));
        assert_eq!(snap.max_ms, Some(9.0));
        assert_eq!(snap.bins.iter().sum::<u64>(), 5);
    }

    #[test]
    fn binning_clamps_to_last_bin() {
        let agg = Aggregate::new(1.0, 4);
        agg.record_latency(&latency(1000, false));
        let snap = agg.snapshot();
        assert_eq!(snap.bins, vec![0, 0, 0, 1]);
    }

    #[test]
    fn binning_is_deterministic_under_replay() {
        let values = [0u64, 1, 2, 2, 7, 31, 500];
        let run = || {
            let agg = Aggregate::new(2.0, 8);
            for v in values {
                agg.record_latency(&latency(v, v % 2 == 0));
            }
            agg.snapshot().bins
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn lost_probes_leave_samples_untouched() {
        let agg = Aggregate::new(2.0, 8);
        agg.record_lost();
        agg.record_lost();
        let snap = agg.snapshot();
        assert_eq!(snap.lost, 2);
        assert_eq!(snap.count, 0);
        assert_eq!(snap.mean_ms, None);
        assert_eq!(snap.min_ms, None);
        assert_eq!(snap.bins.iter().sum::<u64>(), 0);
    }

    #[test]
    fn idle_and_loaded_means_split() {
        let agg = Aggregate::new(2.0, 8);
        agg.record_latency(&latency(10, false));
        agg.record_latency(&latency(30, true));
        agg.record_latency(&latency(50, true));
        let snap = agg.snapshot();
        assert_eq!(snap.idle_mean_ms, Some(10.0));
        assert_eq!(snap.loaded_mean_ms, Some(40.0));
        assert_eq!(snap.mean_ms, Some(30.0));
    }

    #[test]
    fn throughput_tracks_last_and_peak() {
        let agg = Aggregate::new(2.0, 8);
        let sample = |bytes: u64| ThroughputSample {
            direction: Direction::Download,
            bytes_total: bytes,
            duration: Duration::from_secs(1),
            chunks: 1,
            sequence_gaps: 0,
            framing_errors: 0,
        };
        agg.record_throughput(&sample(1000));
        agg.record_throughput(&sample(500));
        let snap = agg.snapshot();
        let dl = snap.download.unwrap();
        assert_eq!(dl.samples, 2);
        assert_eq!(dl.last_bps, 4000.0);
        assert_eq!(dl.peak_bps, 8000.0);
        assert!(snap.upload.is_none());
    }
}
