//! Presentation boundary for measurement results.
//!
//! The [`Reporter`] trait is the observer interface the core publishes to;
//! it never renders, stores, or formats anything itself beyond what the two
//! provided writers do:
//! - [`HumanReadableReporter`] — live progress and a formatted summary on a
//!   terminal.
//! - [`JsonReporter`] — one JSON object per line, suitable for machine
//!   consumption.

use std::io::Write;

use serde::Serialize;

use crate::aggregate::AggregateSnapshot;
use crate::error::Result;
use crate::sample::{Direction, LatencySample, ThroughputSample};
use crate::session::ConnState;

#[derive(Serialize)]
#[serde(tag = "type")]
enum Event<'a> {
    State {
        state: ConnState,
    },
    Latency {
        round_trip_ms: f64,
        one_way_ms: f64,
        responder_processing_ms: f64,
        under_load: bool,
    },
    ProbeLost,
    Throughput {
        direction: Direction,
        throughput_mbps: f64,
        bytes_total: u64,
        duration_ms: f64,
        sequence_gaps: u64,
    },
    ConnectionLost {
        reason: &'a str,
    },
    Summary {
        snapshot: &'a AggregateSnapshot,
    },
}

/// Callbacks for session lifecycle and measurement events.
///
/// A lost sample ([`Reporter::on_probe_lost`]) and a lost connection
/// ([`Reporter::on_connection_lost`]) are reported distinctly: the former
/// means one glitched measurement, the latter that the test cannot continue.
pub trait Reporter {
    /// Called on every connection state transition.
    fn on_state(&mut self, state: ConnState) -> Result<()>;
    /// Called after every completed latency sample.
    fn on_latency(&mut self, sample: &LatencySample) -> Result<()>;
    /// Called when a probe times out without a reply.
    fn on_probe_lost(&mut self) -> Result<()>;
    /// Called after every completed throughput run.
    fn on_throughput(&mut self, sample: &ThroughputSample) -> Result<()>;
    /// Called once when the connection is lost or torn down on error.
    fn on_connection_lost(&mut self, reason: &str) -> Result<()>;
    /// Called with the final aggregate when the session closes.
    fn on_summary(&mut self, snapshot: &AggregateSnapshot) -> Result<()>;
}

/// Discards every event. Useful for tests and embedding.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_state(&mut self, _state: ConnState) -> Result<()> {
        Ok(())
    }
    fn on_latency(&mut self, _sample: &LatencySample) -> Result<()> {
        Ok(())
    }
    fn on_probe_lost(&mut self) -> Result<()> {
        Ok(())
    }
    fn on_throughput(&mut self, _sample: &ThroughputSample) -> Result<()> {
        Ok(())
    }
    fn on_connection_lost(&mut self, _reason: &str) -> Result<()> {
        Ok(())
    }
    fn on_summary(&mut self, _snapshot: &AggregateSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Emits human-readable progress and results to a writer.
pub struct HumanReadableReporter<W: Write> {
    out: W,
}

impl<W: Write> HumanReadableReporter<W> {
    /// Create a new reporter writing to `out`.
    pub fn new(out: W) -> Self {
        HumanReadableReporter { out }
    }
}

impl<W: Write> Reporter for HumanReadableReporter<W> {
    fn on_state(&mut self, state: ConnState) -> Result<()> {
        writeln!(self.out, "connection {state:?}")?;
        Ok(())
    }

    fn on_latency(&mut self, sample: &LatencySample) -> Result<()> {
        write!(
            self.out,
            "\rrtt {:>7.2} ms  one-way {:>7.2} ms  responder {:>6.2} ms{}",
            sample.round_trip_ms(),
            sample.one_way_ms(),
            sample.responder_processing_ms(),
            if sample.under_load {
                "  [under load]"
            } else {
                ""
            }
        )?;
        self.out.flush()?;
        Ok(())
    }

    fn on_probe_lost(&mut self) -> Result<()> {
        write!(self.out, "\rprobe lost (no reply within timeout)")?;
        self.out.flush()?;
        Ok(())
    }

    fn on_throughput(&mut self, sample: &ThroughputSample) -> Result<()> {
        writeln!(
            self.out,
            "\n{:?}: {:>7.1} Mbit/s ({} bytes in {:.2} s{})",
            sample.direction,
            sample.bits_per_second() / 1e6,
            sample.bytes_total,
            sample.duration.as_secs_f64(),
            if sample.sequence_gaps > 0 {
                format!(", {} sequence gaps", sample.sequence_gaps)
            } else {
                String::new()
            }
        )?;
        Ok(())
    }

    fn on_connection_lost(&mut self, reason: &str) -> Result<()> {
        writeln!(self.out, "\nconnection lost: {reason}")?;
        Ok(())
    }

    fn on_summary(&mut self, s: &AggregateSnapshot) -> Result<()> {
        writeln!(self.out, "\nTest results\n")?;
        writeln!(self.out, "{:>12}: {}", "Samples", s.count)?;
        writeln!(self.out, "{:>12}: {}", "Lost", s.lost)?;
        if let (Some(mean), Some(min), Some(max)) = (s.mean_ms, s.min_ms, s.max_ms) {
            writeln!(self.out, "{:>12}: {:>7.2} ms", "Mean RTT", mean)?;
            writeln!(self.out, "{:>12}: {:>7.2} ms", "Best RTT", min)?;
            writeln!(self.out, "{:>12}: {:>7.2} ms", "Worst RTT", max)?;
        }
        if let Some(idle) = s.idle_mean_ms {
            writeln!(self.out, "{:>12}: {:>7.2} ms", "Idle mean", idle)?;
        }
        if let Some(loaded) = s.loaded_mean_ms {
            writeln!(self.out, "{:>12}: {:>7.2} ms", "Loaded mean", loaded)?;
        }
        if let Some(dl) = &s.download {
            writeln!(
                self.out,
                "{:>12}: {:>7.1} Mbit/s (peak {:>7.1})",
                "Download",
                dl.last_bps / 1e6,
                dl.peak_bps / 1e6
            )?;
        }
        if let Some(ul) = &s.upload {
            writeln!(
                self.out,
                "{:>12}: {:>7.1} Mbit/s (peak {:>7.1})",
                "Upload",
                ul.last_bps / 1e6,
                ul.peak_bps / 1e6
            )?;
        }
        Ok(())
    }
}

/// Emits one JSON object per line for each event.
pub struct JsonReporter<W: Write> {
    out: W,
}

impl<W: Write> JsonReporter<W> {
    /// Create a new JSON reporter writing to `out`.
    pub fn new(out: W) -> Self {
        JsonReporter { out }
    }

    fn emit(&mut self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        writeln!(self.out, "{}", json)?;
        Ok(())
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn on_state(&mut self, state: ConnState) -> Result<()> {
        self.emit(&Event::State { state })
    }

    fn on_latency(&mut self, sample: &LatencySample) -> Result<()> {
        self.emit(&Event::Latency {
            round_trip_ms: sample.round_trip_ms(),
            one_way_ms: sample.one_way_ms(),
            responder_processing_ms: sample.responder_processing_ms(),
            under_load: sample.under_load,
        })
    }

    fn on_probe_lost(&mut self) -> Result<()> {
        self.emit(&Event::ProbeLost)
    }

    fn on_throughput(&mut self, sample: &ThroughputSample) -> Result<()> {
        self.emit(&Event::Throughput {
            direction: sample.direction,
            throughput_mbps: sample.bits_per_second() / 1e6,
            bytes_total: sample.bytes_total,
            duration_ms: sample.duration.as_secs_f64() * 1e3,
            sequence_gaps: sample.sequence_gaps,
        })
    }

    fn on_connection_lost(&mut self, reason: &str) -> Result<()> {
        self.emit(&Event::ConnectionLost { reason })
    }

    fn on_summary(&mut self, snapshot: &AggregateSnapshot) -> Result<()> {
        self.emit(&Event::Summary { snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample() -> LatencySample {
        LatencySample {
            round_trip: Duration::from_millis(11),
            responder_processing: Duration::from_millis(1),
            one_way: Duration::from_millis(5),
            under_load: true,
        }
    }

    #[test]
    fn human_readable_latency_line() {
        let mut buf = Vec::new();
        let mut reporter = HumanReadableReporter::new(&mut buf);
        reporter.on_latency(&sample()).unwrap();

        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("11.00 ms"));
        assert!(out.contains("[under load]"));
    }

    #[test]
    fn human_readable_throughput_line() {
        let mut buf = Vec::new();
        let mut reporter = HumanReadableReporter::new(&mut buf);
        reporter
            .on_throughput(&ThroughputSample {
                direction: Direction::Download,
                bytes_total: 1024 * 100,
                duration: Duration::from_millis(500),
                chunks: 100,
                sequence_gaps: 0,
                framing_errors: 0,
            })
            .unwrap();

        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("1.6 Mbit/s"));
    }

    #[test]
    fn json_reporter_valid() {
        let mut buf = Vec::new();
        let mut reporter = JsonReporter::new(&mut buf);
        reporter.on_latency(&sample()).unwrap();

        let out = String::from_utf8(buf).unwrap();
        let res = serde_json::from_str::<serde_json::Value>(&out).unwrap();

        assert_eq!(res["type"], "Latency");
        assert_eq!(res["round_trip_ms"], 11.0);
        assert_eq!(res["under_load"], true);
    }

    #[test]
    fn json_connection_loss_is_distinct_from_probe_loss() {
        let mut buf = Vec::new();
        let mut reporter = JsonReporter::new(&mut buf);
        reporter.on_probe_lost().unwrap();
        reporter.on_connection_lost("peer went away").unwrap();

        let out = String::from_utf8(buf).unwrap();
        let mut lines = out.lines();
        let first: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(first["type"], "ProbeLost");
        assert_eq!(second["type"], "ConnectionLost");
        assert_eq!(second["reason"], "peer went away");
    }
}
