//! Chunked throughput engine.
//!
//! Both directions bracket the transfer with `RUN_START`/`RUN_END` control
//! frames and move payload exclusively in fixed-size chunks, so cancellation
//! at any suspension point leaves no half-framed bytes on the wire. Chunk
//! payloads are random so transparent compression along the path cannot
//! inflate the measurement.

use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{CHUNK_OVERHEAD, Frame};
use crate::sample::{Direction, RunBound, ThroughputSample};
use crate::session::WriterCmd;

/// Inbound stream-run traffic, dispatched by the session reader.
#[derive(Debug)]
pub(crate) enum StreamMsg {
    /// A successfully decoded chunk; `len` is the full frame size.
    Chunk { sequence: u64, len: usize },
    /// A chunk that failed to decode. Counted, never aborts the run.
    Corrupt,
    /// The peer's end-of-run marker with its byte total.
    RunEnd { bytes_total: u64 },
}

/// Receive a download run: request it, count decoded chunk bytes, and time
/// the transfer from first to last chunk.
pub(crate) async fn download(
    chunk_size: usize,
    bound: RunBound,
    io_timeout: Duration,
    writer: mpsc::Sender<WriterCmd>,
    mut incoming: mpsc::Receiver<StreamMsg>,
    mut stop: watch::Receiver<bool>,
) -> Result<ThroughputSample> {
    writer
        .send(WriterCmd::Frame(Frame::RunStart {
            direction: Direction::Download,
            chunk_size: chunk_size as u32,
            bound,
        }))
        .await
        .map_err(|_| Error::Closed)?;

    let started = Instant::now();
    let mut first: Option<Instant> = None;
    let mut last: Option<Instant> = None;
    let mut bytes: u64 = 0;
    let mut chunks: u64 = 0;
    let mut gaps: u64 = 0;
    let mut framing_errors: u64 = 0;
    let mut next_seq: u64 = 0;

    loop {
        tokio::select! {
            msg = tokio::time::timeout(io_timeout, incoming.recv()) => match msg {
                Err(_) => return Err(Error::Timeout("next download chunk")),
                Ok(None) => return Err(Error::Closed),
                Ok(Some(StreamMsg::Chunk { sequence, len })) => {
                    let now = Instant::now();
                    first.get_or_insert(now);
                    last = Some(now);
                    if sequence > next_seq {
                        gaps += sequence - next_seq;
                    }
                    next_seq = sequence.max(next_seq) + 1;
                    bytes += len as u64;
                    chunks += 1;
                }
                Ok(Some(StreamMsg::Corrupt)) => {
                    framing_errors += 1;
                }
                Ok(Some(StreamMsg::RunEnd { bytes_total })) => {
                    debug!(sent = bytes_total, received = bytes, "download run ended by peer");
                    break;
                }
            },
            _ = stop.changed() => {
                // ask the peer to stop feeding; throughput still covers what arrived
                let _ = writer
                    .send(WriterCmd::Frame(Frame::RunEnd {
                        direction: Direction::Download,
                        bytes_total: bytes,
                    }))
                    .await;
                debug!(received = bytes, "download run cancelled");
                break;
            }
        }
    }

    Ok(ThroughputSample {
        direction: Direction::Download,
        bytes_total: bytes,
        duration: transfer_duration(first, last, started),
        chunks,
        sequence_gaps: gaps,
        framing_errors,
    })
}

/// Send an upload run: emit chunks until the bound, mark the end, and adopt
/// the responder-acknowledged byte total. The duration is the sender's own
/// send-completion time, which is what the sender actually experienced.
pub(crate) async fn upload(
    chunk_size: usize,
    bound: RunBound,
    io_timeout: Duration,
    writer: mpsc::Sender<WriterCmd>,
    mut incoming: mpsc::Receiver<StreamMsg>,
    mut stop: watch::Receiver<bool>,
) -> Result<ThroughputSample> {
    writer
        .send(WriterCmd::Frame(Frame::RunStart {
            direction: Direction::Upload,
            chunk_size: chunk_size as u32,
            bound,
        }))
        .await
        .map_err(|_| Error::Closed)?;

    let mut rng = StdRng::from_os_rng();
    let mut payload = vec![0u8; chunk_size - CHUNK_OVERHEAD];
    rng.fill_bytes(&mut payload);
    let payload = Bytes::from(payload);

    let (deadline, byte_target) = match bound {
        RunBound::Duration(d) => (Some(Instant::now() + d), None),
        RunBound::Bytes(n) => (None, Some(n)),
    };

    let started = Instant::now();
    let mut sent: u64 = 0;
    let mut sequence: u64 = 0;

    loop {
        if byte_target.is_some_and(|target| sent >= target) {
            break;
        }
        let chunk = Frame::chunk(sequence, payload.clone());
        tokio::select! {
            res = writer.send(WriterCmd::Frame(chunk)) => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
                sent += chunk_size as u64;
                sequence += 1;
            }
            _ = sleep_until_opt(deadline) => break,
            _ = stop.changed() => {
                debug!(sent, "upload run cancelled");
                break;
            }
        }
    }
    let send_elapsed = started.elapsed().max(Duration::from_micros(1));

    writer
        .send(WriterCmd::Frame(Frame::RunEnd {
            direction: Direction::Upload,
            bytes_total: sent,
        }))
        .await
        .map_err(|_| Error::Closed)?;

    // the responder acknowledges with the byte total it actually counted
    let acknowledged = loop {
        match tokio::time::timeout(io_timeout, incoming.recv()).await {
            Ok(Some(StreamMsg::RunEnd { bytes_total })) => break Some(bytes_total),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break None,
        }
    };
    let bytes_total = acknowledged.unwrap_or_else(|| {
        warn!(sent, "upload acknowledgement missing, reporting locally counted bytes");
        sent
    });

    Ok(ThroughputSample {
        direction: Direction::Upload,
        bytes_total,
        duration: send_elapsed,
        chunks: sequence,
        sequence_gaps: 0,
        framing_errors: 0,
    })
}

fn transfer_duration(
    first: Option<Instant>,
    last: Option<Instant>,
    started: Instant,
) -> Duration {
    match (first, last) {
        (Some(f), Some(l)) if l > f => l - f,
        // zero or one chunk: fall back to the run's own elapsed time
        _ => started.elapsed().max(Duration::from_micros(1)),
    }
}

/// Sleep until the deadline, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::IO_TIMEOUT;

    struct Harness {
        writer_rx: mpsc::Receiver<WriterCmd>,
        incoming_tx: mpsc::Sender<StreamMsg>,
        stop: watch::Sender<bool>,
    }

    fn channels() -> (
        Harness,
        mpsc::Sender<WriterCmd>,
        mpsc::Receiver<StreamMsg>,
        watch::Receiver<bool>,
    ) {
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Harness {
                writer_rx,
                incoming_tx,
                stop: stop_tx,
            },
            writer_tx,
            incoming_rx,
            stop_rx,
        )
    }

    #[tokio::test]
    async fn download_counts_decoded_chunks_only() {
        let (mut h, writer_tx, incoming_rx, stop_rx) = channels();
        let task = tokio::spawn(download(
            1024,
            RunBound::Bytes(1024 * 4),
            IO_TIMEOUT,
            writer_tx,
            incoming_rx,
            stop_rx,
        ));

        // engine requests the run
        match h.writer_rx.recv().await.unwrap() {
            WriterCmd::Frame(Frame::RunStart { direction, .. }) => {
                assert_eq!(direction, Direction::Download)
            }
            other => panic!("unexpected: {other:?}"),
        }

        for seq in 0..4u64 {
            h.incoming_tx
                .send(StreamMsg::Chunk {
                    sequence: seq,
                    len: 1024,
                })
                .await
                .unwrap();
        }
        h.incoming_tx.send(StreamMsg::Corrupt).await.unwrap();
        h.incoming_tx
            .send(StreamMsg::RunEnd { bytes_total: 5120 })
            .await
            .unwrap();

        let sample = task.await.unwrap().unwrap();
        assert_eq!(sample.bytes_total, 4096);
        assert_eq!(sample.chunks, 4);
        assert_eq!(sample.framing_errors, 1);
        assert_eq!(sample.sequence_gaps, 0);
        assert!(sample.duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn download_records_sequence_gaps_without_aborting() {
        let (h, writer_tx, incoming_rx, stop_rx) = channels();
        let task = tokio::spawn(download(
            1024,
            RunBound::Bytes(1024 * 3),
            IO_TIMEOUT,
            writer_tx,
            incoming_rx,
            stop_rx,
        ));

        for seq in [0u64, 1, 4] {
            h.incoming_tx
                .send(StreamMsg::Chunk { sequence: seq, len: 1024 })
                .await
                .unwrap();
        }
        h.incoming_tx
            .send(StreamMsg::RunEnd { bytes_total: 5120 })
            .await
            .unwrap();

        let sample = task.await.unwrap().unwrap();
        assert_eq!(sample.bytes_total, 3072);
        assert_eq!(sample.sequence_gaps, 2);
    }

    #[tokio::test]
    async fn download_cancellation_keeps_received_bytes() {
        let (mut h, writer_tx, incoming_rx, stop_rx) = channels();
        let task = tokio::spawn(download(
            1024,
            RunBound::Duration(Duration::from_secs(60)),
            IO_TIMEOUT,
            writer_tx,
            incoming_rx,
            stop_rx,
        ));

        // swallow the RunStart
        let _ = h.writer_rx.recv().await.unwrap();

        for seq in 0..2u64 {
            h.incoming_tx
                .send(StreamMsg::Chunk { sequence: seq, len: 1024 })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = h.stop.send(true);

        let sample = task.await.unwrap().unwrap();
        assert_eq!(sample.bytes_total, 2048);

        // the cancel is signalled upstream so the peer stops feeding
        match h.writer_rx.recv().await.unwrap() {
            WriterCmd::Frame(Frame::RunEnd { direction, bytes_total }) => {
                assert_eq!(direction, Direction::Download);
                assert_eq!(bytes_total, 2048);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_respects_byte_target_and_ack() {
        let (mut h, writer_tx, incoming_rx, stop_rx) = channels();
        let task = tokio::spawn(upload(
            1024,
            RunBound::Bytes(4096),
            IO_TIMEOUT,
            writer_tx,
            incoming_rx,
            stop_rx,
        ));

        let mut sent_chunks = 0u64;
        loop {
            match h.writer_rx.recv().await.unwrap() {
                WriterCmd::Frame(Frame::RunStart { direction, chunk_size, .. }) => {
                    assert_eq!(direction, Direction::Upload);
                    assert_eq!(chunk_size, 1024);
                }
                WriterCmd::Frame(Frame::Chunk { payload, .. }) => {
                    assert_eq!(payload.len(), 1024 - CHUNK_OVERHEAD);
                    sent_chunks += 1;
                }
                WriterCmd::Frame(Frame::RunEnd { bytes_total, .. }) => {
                    assert_eq!(bytes_total, 4096);
                    break;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(sent_chunks, 4);

        h.incoming_tx
            .send(StreamMsg::RunEnd { bytes_total: 4096 })
            .await
            .unwrap();

        let sample = task.await.unwrap().unwrap();
        assert_eq!(sample.bytes_total, 4096);
        assert_eq!(sample.chunks, 4);
        assert!(sample.duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn upload_missing_ack_falls_back_to_local_count() {
        let (mut h, writer_tx, incoming_rx, stop_rx) = channels();
        let task = tokio::spawn(upload(
            1024,
            RunBound::Bytes(4096),
            Duration::from_millis(50),
            writer_tx,
            incoming_rx,
            stop_rx,
        ));

        // drain the run without ever acknowledging it
        loop {
            if let WriterCmd::Frame(Frame::RunEnd { bytes_total, .. }) =
                h.writer_rx.recv().await.unwrap()
            {
                assert_eq!(bytes_total, 4096);
                break;
            }
        }

        // after the ack timeout the locally counted total stands
        let sample = task.await.unwrap().unwrap();
        assert_eq!(sample.bytes_total, 4096);
        assert_eq!(sample.chunks, 4);
    }

    #[tokio::test]
    async fn upload_cancellation_reports_acknowledged_bytes() {
        let (mut h, writer_tx, incoming_rx, stop_rx) = channels();
        let task = tokio::spawn(upload(
            1024,
            RunBound::Duration(Duration::from_secs(60)),
            IO_TIMEOUT,
            writer_tx,
            incoming_rx,
            stop_rx,
        ));

        // let a few whole chunks through, then cancel
        let mut seen = 0;
        while seen < 3 {
            if let WriterCmd::Frame(Frame::Chunk { .. }) = h.writer_rx.recv().await.unwrap() {
                seen += 1;
            }
        }
        let _ = h.stop.send(true);

        // drain until the end marker, acknowledging what the "responder" saw
        let client_total = loop {
            match h.writer_rx.recv().await.unwrap() {
                WriterCmd::Frame(Frame::RunEnd { bytes_total, .. }) => break bytes_total,
                WriterCmd::Frame(Frame::Chunk { .. }) => continue,
                other => panic!("unexpected: {other:?}"),
            }
        };
        assert_eq!(client_total % 1024, 0, "only whole chunks are ever counted");

        h.incoming_tx
            .send(StreamMsg::RunEnd { bytes_total: client_total })
            .await
            .unwrap();

        let sample = task.await.unwrap().unwrap();
        assert_eq!(sample.bytes_total, client_total);
    }
}
