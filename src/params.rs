//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Default size of a data chunk, header included (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 13;

/// Smallest chunk size that still leaves room for a payload.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Default interval between latency probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Default time after which an unanswered probe is marked lost.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default duration bound for a throughput run.
pub const DEFAULT_RUN_DURATION: Duration = Duration::from_secs(10);

/// Timeout for individual I/O waits (next chunk, upload acknowledgement).
pub const IO_TIMEOUT: Duration = Duration::from_secs(7);

/// Default width of a latency histogram bin, in milliseconds.
pub const DEFAULT_BIN_WIDTH_MS: f64 = 2.0;

/// Default number of latency histogram bins.
pub const DEFAULT_BIN_COUNT: usize = 64;

/// Number of malformed frames tolerated before the connection is torn down.
pub const DEFAULT_FRAMING_ERROR_THRESHOLD: u32 = 8;

/// Depth of the serialized outbound frame queue.
pub const WRITE_QUEUE_DEPTH: usize = 32;

/// Depth of the sample/event queue feeding the aggregator.
pub const EVENT_QUEUE_DEPTH: usize = 64;
