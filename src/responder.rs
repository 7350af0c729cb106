//! Server side of the measurement protocol.
//!
//! One [`serve`] call owns one accepted WebSocket for its whole lifetime.
//! The socket loop answers probes inline so the reply timestamp is taken
//! right before the write, and funnels chunk traffic from the feeder task
//! through the same sink so frames are never interleaved mid-frame.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::frame::{CHUNK_OVERHEAD, Frame};
use crate::params;
use crate::sample::{Direction, RunBound};
use crate::stream::sleep_until_opt;

struct FeederHandle {
    stop: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

struct UploadRun {
    chunk_size: usize,
    bytes: u64,
    chunks: u64,
    framing_errors: u64,
}

/// Serve one measurement connection until the peer closes it.
///
/// - `PING` is answered with `PONG` carrying receive and send timestamps in
///   this process's clock domain.
/// - `RUN_START{download}` spawns a chunk feeder bounded by the requested
///   duration or byte target; an inbound `RUN_END{download}` cancels it.
/// - `RUN_START{upload}` starts counting inbound chunks; the client's
///   `RUN_END{upload}` is acknowledged with the byte total actually counted.
///
/// Malformed frames are discarded and counted against the active upload run;
/// they never abort the connection here.
pub async fn serve<S>(ws: WebSocketStream<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let clock = Clock::new();
    let (mut sink, mut stream) = ws.split();
    let (feed_tx, mut feed_rx) = mpsc::channel::<Frame>(params::WRITE_QUEUE_DEPTH);
    let mut download: Option<FeederHandle> = None;
    let mut upload: Option<UploadRun> = None;

    let result = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let received = clock.now();
                    let chunk_size = upload.as_ref().map(|u| u.chunk_size);
                    match Frame::decode(&data, chunk_size) {
                        Ok(Frame::Ping { t1 }) => {
                            // t3 is captured immediately before the write so the
                            // interval t3 - t2 reflects processing, not queueing
                            let pong = Frame::Pong {
                                t1,
                                t2: received.0,
                                t3: clock.now().0,
                            };
                            if let Err(e) = sink.send(Message::Binary(pong.encode().into())).await {
                                break Err(Error::from(e));
                            }
                        }
                        Ok(Frame::RunStart {
                            direction: Direction::Download,
                            chunk_size,
                            bound,
                        }) => {
                            if download.is_some() {
                                warn!("download run already active, ignoring RUN_START");
                                continue;
                            }
                            if (chunk_size as usize) < params::MIN_CHUNK_SIZE {
                                warn!(chunk_size, "unusable chunk size, ignoring RUN_START");
                                continue;
                            }
                            info!(chunk_size, ?bound, "download run started");
                            let (stop_tx, stop_rx) = watch::channel(false);
                            let task = tokio::spawn(feed_chunks(
                                chunk_size as usize,
                                bound,
                                feed_tx.clone(),
                                stop_rx,
                            ));
                            download = Some(FeederHandle {
                                stop: stop_tx,
                                _task: task,
                            });
                        }
                        Ok(Frame::RunEnd {
                            direction: Direction::Download,
                            ..
                        }) => {
                            // the initiator cancelled; stop feeding
                            if let Some(h) = download.take() {
                                let _ = h.stop.send(true);
                                debug!("download run cancelled by peer");
                            }
                        }
                        Ok(Frame::RunStart {
                            direction: Direction::Upload,
                            chunk_size,
                            ..
                        }) => {
                            info!(chunk_size, "upload run started");
                            upload = Some(UploadRun {
                                chunk_size: chunk_size as usize,
                                bytes: 0,
                                chunks: 0,
                                framing_errors: 0,
                            });
                        }
                        Ok(Frame::Chunk { payload, .. }) => {
                            if let Some(u) = upload.as_mut() {
                                u.bytes += (CHUNK_OVERHEAD + payload.len()) as u64;
                                u.chunks += 1;
                            }
                        }
                        Ok(Frame::RunEnd {
                            direction: Direction::Upload,
                            bytes_total,
                        }) => {
                            if let Some(u) = upload.take() {
                                debug!(
                                    client_bytes = bytes_total,
                                    counted = u.bytes,
                                    chunks = u.chunks,
                                    framing_errors = u.framing_errors,
                                    "upload run ended"
                                );
                                let ack = Frame::RunEnd {
                                    direction: Direction::Upload,
                                    bytes_total: u.bytes,
                                };
                                if let Err(e) = sink.send(Message::Binary(ack.encode().into())).await {
                                    break Err(Error::from(e));
                                }
                            }
                        }
                        Ok(Frame::Pong { .. }) => {
                            warn!("unexpected PONG at responder, dropped");
                        }
                        Err(e) => {
                            warn!(error = %e, "discarding malformed frame");
                            if let Some(u) = upload.as_mut() {
                                u.framing_errors += 1;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(Error::from(e)),
            },
            frame = feed_rx.recv() => {
                // the feeder's traffic shares the one serialized write path
                if let Some(frame) = frame {
                    let run_done = matches!(frame, Frame::RunEnd { .. });
                    if let Err(e) = sink.send(Message::Binary(frame.encode().into())).await {
                        break Err(Error::from(e));
                    }
                    if run_done {
                        download = None;
                    }
                }
            }
        }
    };

    if let Some(h) = download.take() {
        let _ = h.stop.send(true);
    }
    let _ = sink.close().await;
    result
}

/// Emit chunks at the maximum rate the write path accepts, until the bound.
async fn feed_chunks(
    chunk_size: usize,
    bound: RunBound,
    tx: mpsc::Sender<Frame>,
    mut stop: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_os_rng();
    let mut payload = vec![0u8; chunk_size.saturating_sub(CHUNK_OVERHEAD)];
    rng.fill_bytes(&mut payload);
    let payload = Bytes::from(payload);

    let (deadline, target) = match bound {
        RunBound::Duration(d) => (Some(Instant::now() + d), None),
        RunBound::Bytes(n) => (None, Some(n)),
    };

    let mut sent = 0u64;
    let mut sequence = 0u64;
    loop {
        if target.is_some_and(|t| sent >= t) {
            break;
        }
        tokio::select! {
            res = tx.send(Frame::chunk(sequence, payload.clone())) => {
                if res.is_err() {
                    return;
                }
                sent += chunk_size as u64;
                sequence += 1;
            }
            _ = sleep_until_opt(deadline) => break,
            _ = stop.changed() => break,
        }
    }
    debug!(sent, chunks = sequence, "download feed complete");
    let _ = tx
        .send(Frame::RunEnd {
            direction: Direction::Download,
            bytes_total: sent,
        })
        .await;
}
