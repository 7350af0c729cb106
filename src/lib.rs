//! A network path quality measurement library.
//!
//! pathprobe measures latency and throughput between an initiator and a
//! responder over a single persistent WebSocket connection. Latency is probed
//! on a fixed cadence both while the path is idle and while a bulk transfer
//! is running, so responsiveness under load can be compared against the idle
//! baseline. Download and upload throughput are measured with bounded runs of
//! fixed-size binary chunks over the same connection.
//!
//! # Quick start
//!
//! ```no_run
//! use pathprobe::config::SessionConfig;
//! use pathprobe::report::NullReporter;
//! use pathprobe::sample::{Direction, RunBound, RunKind};
//! use pathprobe::session::Session;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::connect(
//!     "ws://measure.example.net:4700/measure",
//!     SessionConfig::default(),
//!     Box::new(NullReporter),
//! )
//! .await?;
//!
//! session.start_latency_run()?;
//! let download = session.start_throughput_run(
//!     Direction::Download,
//!     RunBound::Duration(Duration::from_secs(10)),
//! )?;
//! let sample = download.await?;
//! println!("{:.1} Mbit/s", sample.bits_per_second() / 1e6);
//!
//! session.stop(RunKind::Probe);
//! println!("{:?}", session.snapshot());
//! session.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod params;
mod probe;
pub mod report;
pub mod responder;
pub mod sample;
pub mod session;
mod stream;
