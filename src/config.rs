//! Session configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::CHUNK_OVERHEAD;
use crate::params;
use crate::sample::RunBound;

/// Recognized options for one session. All defaults are explicit; see the
/// constants in [`crate::params`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Size of every chunk frame, header included. Fixed for the lifetime
    /// of a run and carried to the peer in `RunStart`.
    pub chunk_size: usize,
    /// Interval between latency probes.
    pub probe_interval: Duration,
    /// Time after which an unanswered probe is marked lost.
    pub probe_timeout: Duration,
    /// Width of one latency histogram bin, in milliseconds.
    pub histogram_bin_width_ms: f64,
    /// Number of latency histogram bins. Values past the range land in the
    /// last bin.
    pub histogram_bin_count: usize,
    /// Default bound for throughput runs started without an explicit one.
    pub run_bound: RunBound,
    /// Malformed frames tolerated before the connection is torn down.
    pub framing_error_threshold: u32,
    /// Timeout for individual I/O waits.
    pub io_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            chunk_size: params::DEFAULT_CHUNK_SIZE,
            probe_interval: params::DEFAULT_PROBE_INTERVAL,
            probe_timeout: params::DEFAULT_PROBE_TIMEOUT,
            histogram_bin_width_ms: params::DEFAULT_BIN_WIDTH_MS,
            histogram_bin_count: params::DEFAULT_BIN_COUNT,
            run_bound: RunBound::Duration(params::DEFAULT_RUN_DURATION),
            framing_error_threshold: params::DEFAULT_FRAMING_ERROR_THRESHOLD,
            io_timeout: params::IO_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Reject configurations the protocol cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < params::MIN_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size {} below minimum {} ({} bytes of it are framing overhead)",
                self.chunk_size,
                params::MIN_CHUNK_SIZE,
                CHUNK_OVERHEAD,
            )));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::Config(
                "probe_interval and probe_timeout must be positive".into(),
            ));
        }
        if self.histogram_bin_count == 0 || self.histogram_bin_width_ms <= 0.0 {
            return Err(Error::Config(
                "histogram needs at least one bin of positive width".into(),
            ));
        }
        match self.run_bound {
            RunBound::Duration(d) if d.is_zero() => {
                return Err(Error::Config("run duration must be positive".into()));
            }
            RunBound::Bytes(0) => {
                return Err(Error::Config("run byte target must be positive".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn undersized_chunk_rejected() {
        let cfg = SessionConfig {
            chunk_size: 8,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_bound_rejected() {
        let cfg = SessionConfig {
            run_bound: RunBound::Bytes(0),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
