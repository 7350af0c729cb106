//! Measurement sample types produced by the probe and stream engines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Micros;

/// Direction of a throughput run, from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server-to-client transfer.
    Download,
    /// Client-to-server transfer.
    Upload,
}

/// The concurrently schedulable run slots of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// The latency probe run.
    Probe,
    /// The download stream run.
    Download,
    /// The upload stream run.
    Upload,
}

/// Termination bound for a throughput run: whichever is configured ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBound {
    /// Run for this long.
    Duration(Duration),
    /// Run until this many bytes were transferred.
    Bytes(u64),
}

/// One completed latency probe.
///
/// The one-way estimate assumes symmetric forward and reverse path delay;
/// it is a derived figure, not a measurement, and consumers should treat it
/// as such.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySample {
    /// Full round trip as observed by the initiator (`t4 - t1`).
    pub round_trip: Duration,
    /// Time the responder spent between receipt and reply (`t3 - t2`).
    pub responder_processing: Duration,
    /// `(round_trip - responder_processing) / 2`, under the symmetry assumption.
    pub one_way: Duration,
    /// Whether a stream run was active when the probe was sent.
    pub under_load: bool,
}

impl LatencySample {
    /// Derive a sample from the four probe timestamps.
    ///
    /// `t1`/`t4` are initiator-domain, `t2`/`t3` responder-domain; only
    /// same-domain differences are taken. Responder processing is clamped so
    /// that clock jitter across domains cannot produce a negative one-way
    /// estimate.
    pub fn derive(t1: Micros, t2: Micros, t3: Micros, t4: Micros, under_load: bool) -> Self {
        let round_trip = t4.saturating_since(t1);
        let responder_processing = t3.saturating_since(t2);
        let one_way = round_trip
            .checked_sub(responder_processing)
            .unwrap_or_default()
            / 2;
        LatencySample {
            round_trip,
            responder_processing,
            one_way,
            under_load,
        }
    }

    /// Round-trip time in milliseconds.
    pub fn round_trip_ms(&self) -> f64 {
        self.round_trip.as_secs_f64() * 1e3
    }

    /// Responder processing time in milliseconds.
    pub fn responder_processing_ms(&self) -> f64 {
        self.responder_processing.as_secs_f64() * 1e3
    }

    /// One-way estimate in milliseconds.
    pub fn one_way_ms(&self) -> f64 {
        self.one_way.as_secs_f64() * 1e3
    }
}

/// One completed (or cancelled) throughput run.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputSample {
    /// Transfer direction.
    pub direction: Direction,
    /// Bytes actually transferred. For uploads this is the responder-
    /// acknowledged total; for downloads, bytes of successfully decoded chunks.
    pub bytes_total: u64,
    /// Wall-clock duration of the transfer, always positive.
    pub duration: Duration,
    /// Whole chunks counted into `bytes_total`.
    pub chunks: u64,
    /// Sequence numbers skipped by the chunk stream (download only).
    pub sequence_gaps: u64,
    /// Malformed chunks discarded without aborting the run.
    pub framing_errors: u64,
}

impl ThroughputSample {
    /// Throughput in bits per second.
    pub fn bits_per_second(&self) -> f64 {
        self.bytes_total as f64 * 8.0 / self.duration.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_decomposes_round_trip() {
        // PING at t1=0ms, responder receives t2=5ms, replies t3=6ms,
        // initiator receives t4=11ms.
        let s = LatencySample::derive(
            Micros(0),
            Micros(5_000),
            Micros(6_000),
            Micros(11_000),
            false,
        );
        assert_eq!(s.round_trip, Duration::from_millis(11));
        assert_eq!(s.responder_processing, Duration::from_millis(1));
        assert_eq!(s.one_way, Duration::from_millis(5));
        assert!(!s.under_load);
    }

    #[test]
    fn derive_holds_ordering_invariant() {
        let s = LatencySample::derive(
            Micros(100),
            Micros(90_000),
            Micros(90_400),
            Micros(2_300),
            true,
        );
        assert!(s.round_trip >= Duration::ZERO);
        assert!(s.round_trip >= s.one_way);
        assert!(s.under_load);
    }

    #[test]
    fn derive_clamps_foreign_clock_excess() {
        // responder-domain interval larger than the round trip: the one-way
        // estimate degrades to zero instead of going negative
        let s = LatencySample::derive(Micros(0), Micros(0), Micros(50_000), Micros(10_000), false);
        assert_eq!(s.one_way, Duration::ZERO);
    }

    #[test]
    fn throughput_bits_per_second() {
        // 100 chunks of 1024 bytes in half a second
        let s = ThroughputSample {
            direction: Direction::Download,
            bytes_total: 1024 * 100,
            duration: Duration::from_millis(500),
            chunks: 100,
            sequence_gaps: 0,
            framing_errors: 0,
        };
        assert_eq!(s.bits_per_second(), 1_638_400.0);
    }
}
