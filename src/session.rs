//! Session orchestration over one persistent connection.
//!
//! A [`Session`] owns one duplex WebSocket and multiplexes up to three
//! concurrent runs over it: one latency probe run, one download run and one
//! upload run. All outbound frames funnel through a single writer task, so
//! frames from concurrent engines are serialized and never interleaved
//! mid-frame; inbound frames are decoded once by the reader task and
//! dispatched by kind to whichever run is waiting for them.
//!
//! Connection lifecycle is `Disconnected -> Connecting -> Connected ->
//! Running(*) -> Connected -> Closing -> Closed`. The first two phases live
//! inside [`Session::connect`]; once a `Session` exists it is `Connected`.
//! There is no reconnection policy here: after `Closed` the caller decides
//! whether to connect again.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, warn};
use url::Url;

use crate::aggregate::{Aggregate, AggregateSnapshot};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::frame::{CHUNK_OVERHEAD, Frame};
use crate::params;
use crate::probe::{self, PongMsg};
use crate::report::Reporter;
use crate::sample::{Direction, LatencySample, RunBound, RunKind, ThroughputSample};
use crate::stream::{self, StreamMsg};

/// Type alias for the WebSocket stream used by [`Session::connect`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    /// No connection exists.
    Disconnected,
    /// Transport and handshake in progress.
    Connecting,
    /// Ready; runs may be started.
    Connected,
    /// Shutting down, all runs cancelled.
    Closing,
    /// Terminal. The session will not reconnect by itself.
    Closed,
}

/// Commands accepted by the single serialized writer task.
#[derive(Debug)]
pub(crate) enum WriterCmd {
    Frame(Frame),
    Shutdown,
}

/// Sample stream and lifecycle notifications, folded into the aggregate and
/// forwarded to the reporter by one consumer task.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Latency(LatencySample),
    ProbeLost,
    Throughput(ThroughputSample),
    State(ConnState),
    ConnectionLost(String),
    Summary(AggregateSnapshot),
}

#[derive(Default)]
struct Routes {
    pong: Option<mpsc::Sender<PongMsg>>,
    download: Option<mpsc::Sender<StreamMsg>>,
    upload: Option<mpsc::Sender<StreamMsg>>,
}

struct RunHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    probe: Option<RunHandle>,
    download: Option<RunHandle>,
    upload: Option<RunHandle>,
}

impl Slots {
    fn take_all(&mut self) -> Vec<RunHandle> {
        [
            self.probe.take(),
            self.download.take(),
            self.upload.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

struct Shared {
    state: watch::Sender<ConnState>,
    // lock order: slots before routes, never the other way around
    slots: Mutex<Slots>,
    routes: Mutex<Routes>,
    stream_active: Arc<AtomicUsize>,
    framing_errors: AtomicU32,
}

impl Shared {
    fn set_state(&self, next: ConnState) -> bool {
        self.state.send_if_modified(|current| {
            // Closed is terminal, nothing transitions out of it
            if *current == next || *current == ConnState::Closed {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn cancel_runs(&self) {
        let slots = self.slots.lock().unwrap();
        for handle in [&slots.probe, &slots.download, &slots.upload]
            .into_iter()
            .flatten()
        {
            let _ = handle.stop.send(true);
        }
    }
}

/// One measurement session over one connection.
pub struct Session {
    shared: Arc<Shared>,
    writer: mpsc::Sender<WriterCmd>,
    events: mpsc::Sender<SessionEvent>,
    clock: Clock,
    cfg: SessionConfig,
    aggregate: Arc<Aggregate>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    events_task: JoinHandle<()>,
}

impl Session {
    /// Connect to a `ws://` or `wss://` measurement endpoint.
    ///
    /// Covers the `Disconnected -> Connecting -> Connected` leg of the state
    /// machine; a transport or handshake failure surfaces as
    /// [`Error::Connection`] and leaves nothing behind.
    pub async fn connect(
        endpoint: &str,
        cfg: SessionConfig,
        reporter: Box<dyn Reporter + Send>,
    ) -> Result<Session> {
        cfg.validate()?;
        let url = Url::parse(endpoint)?;
        let request = url.as_str().into_client_request()?;

        // Connect using rustls for TLS.
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(root_store)
        .with_no_client_auth();

        let connector = Connector::Rustls(Arc::new(tls_config));
        let (ws, _response) =
            connect_async_tls_with_config(request, None, false, Some(connector)).await?;

        Self::from_stream(ws, cfg, reporter)
    }

    /// Build a session over an already-established transport.
    ///
    /// This is the boundary for callers that do their own connection
    /// plumbing; the stream only has to be a completed WebSocket handshake.
    pub fn from_stream<S>(
        ws: WebSocketStream<S>,
        cfg: SessionConfig,
        reporter: Box<dyn Reporter + Send>,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        cfg.validate()?;
        let clock = Clock::new();
        let aggregate = Arc::new(Aggregate::new(
            cfg.histogram_bin_width_ms,
            cfg.histogram_bin_count,
        ));
        let (sink, stream) = ws.split();
        let (writer_tx, writer_rx) = mpsc::channel(params::WRITE_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(params::EVENT_QUEUE_DEPTH);
        let (state_tx, _) = watch::channel(ConnState::Connected);

        let shared = Arc::new(Shared {
            state: state_tx,
            slots: Mutex::new(Slots::default()),
            routes: Mutex::new(Routes::default()),
            stream_active: Arc::new(AtomicUsize::new(0)),
            framing_errors: AtomicU32::new(0),
        });

        let writer_task = tokio::spawn(write_loop(sink, writer_rx));
        let reader_task = tokio::spawn(read_loop(
            stream,
            Arc::clone(&shared),
            writer_tx.clone(),
            event_tx.clone(),
            clock,
            cfg.chunk_size,
            cfg.framing_error_threshold,
        ));
        let events_task = tokio::spawn(event_loop(event_rx, Arc::clone(&aggregate), reporter));

        let session = Session {
            shared,
            writer: writer_tx,
            events: event_tx,
            clock,
            cfg,
            aggregate,
            reader_task,
            writer_task,
            events_task,
        };
        let _ = session.events.try_send(SessionEvent::State(ConnState::Connected));
        Ok(session)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.shared.state.borrow()
    }

    /// Snapshot of whether the connection is usable right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Block until the connection reaches `target`. Prefer this over
    /// polling [`Session::is_connected`] in a loop.
    pub async fn wait_for_state(&self, target: ConnState) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        rx.wait_for(|s| *s == target)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Block until the connection is usable.
    pub async fn wait_connected(&self) -> Result<()> {
        self.wait_for_state(ConnState::Connected).await
    }

    /// Read-only copy of the running statistics.
    pub fn snapshot(&self) -> AggregateSnapshot {
        self.aggregate.snapshot()
    }

    /// Start the latency probe run at the configured interval. It keeps
    /// probing, through any concurrent stream runs, until stopped or the
    /// connection goes away.
    pub fn start_latency_run(&self) -> Result<()> {
        self.ensure_connected("start_latency_run")?;
        let mut slots = self.shared.slots.lock().unwrap();
        if slots.probe.is_some() {
            return Err(Error::RunActive(RunKind::Probe));
        }

        let (pong_tx, pong_rx) = mpsc::channel(params::EVENT_QUEUE_DEPTH);
        self.shared.routes.lock().unwrap().pong = Some(pong_tx);
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::clone(&self.shared);
        let writer = self.writer.clone();
        let events = self.events.clone();
        let clock = self.clock;
        let interval = self.cfg.probe_interval;
        let timeout = self.cfg.probe_timeout;
        let load = Arc::clone(&self.shared.stream_active);

        let task = tokio::spawn(async move {
            probe::run(clock, interval, timeout, writer, pong_rx, load, events, stop_rx).await;
            shared.slots.lock().unwrap().probe = None;
            shared.routes.lock().unwrap().pong = None;
            debug!("probe run finished");
        });
        slots.probe = Some(RunHandle {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Start a throughput run in `direction`, bounded by `bound`.
    ///
    /// At most one run per direction is active at a time; directions and the
    /// probe run may overlap freely. The returned receiver yields the run's
    /// [`ThroughputSample`] when it completes, including completion by
    /// cancellation; it is dropped without a sample if the connection dies
    /// mid-run.
    pub fn start_throughput_run(
        &self,
        direction: Direction,
        bound: RunBound,
    ) -> Result<oneshot::Receiver<ThroughputSample>> {
        self.ensure_connected("start_throughput_run")?;
        let mut slots = self.shared.slots.lock().unwrap();
        let (slot_busy, run_kind) = match direction {
            Direction::Download => (slots.download.is_some(), RunKind::Download),
            Direction::Upload => (slots.upload.is_some(), RunKind::Upload),
        };
        if slot_busy {
            return Err(Error::RunActive(run_kind));
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(params::EVENT_QUEUE_DEPTH);
        {
            let mut routes = self.shared.routes.lock().unwrap();
            match direction {
                Direction::Download => routes.download = Some(incoming_tx),
                Direction::Upload => routes.upload = Some(incoming_tx),
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        self.shared.stream_active.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let writer = self.writer.clone();
        let events = self.events.clone();
        let chunk_size = self.cfg.chunk_size;
        let io_timeout = self.cfg.io_timeout;

        let task = tokio::spawn(async move {
            let result = match direction {
                Direction::Download => {
                    stream::download(chunk_size, bound, io_timeout, writer, incoming_rx, stop_rx)
                        .await
                }
                Direction::Upload => {
                    stream::upload(chunk_size, bound, io_timeout, writer, incoming_rx, stop_rx)
                        .await
                }
            };
            shared.stream_active.fetch_sub(1, Ordering::Relaxed);
            {
                let mut slots = shared.slots.lock().unwrap();
                match direction {
                    Direction::Download => slots.download = None,
                    Direction::Upload => slots.upload = None,
                }
            }
            {
                let mut routes = shared.routes.lock().unwrap();
                match direction {
                    Direction::Download => routes.download = None,
                    Direction::Upload => routes.upload = None,
                }
            }
            match result {
                Ok(sample) => {
                    let _ = events.send(SessionEvent::Throughput(sample.clone())).await;
                    let _ = done_tx.send(sample);
                }
                Err(e) => debug!(error = %e, ?direction, "stream run ended without a sample"),
            }
        });

        let handle = RunHandle {
            stop: stop_tx,
            task,
        };
        match direction {
            Direction::Download => slots.download = Some(handle),
            Direction::Upload => slots.upload = Some(handle),
        }
        Ok(done_rx)
    }

    /// Request cancellation of the given run. The engine observes the signal
    /// at its next suspension point; a stream run still yields its sample
    /// for the bytes transferred so far.
    pub fn stop(&self, kind: RunKind) {
        let slots = self.shared.slots.lock().unwrap();
        let handle = match kind {
            RunKind::Probe => slots.probe.as_ref(),
            RunKind::Download => slots.download.as_ref(),
            RunKind::Upload => slots.upload.as_ref(),
        };
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
        }
    }

    /// Cancel all runs, close the connection and flush the final summary to
    /// the reporter. `Closing -> Closed` always completes.
    pub async fn close(self) {
        let Session {
            shared,
            writer,
            events,
            clock: _,
            cfg,
            aggregate,
            reader_task,
            writer_task,
            events_task,
        } = self;

        if shared.set_state(ConnState::Closing) {
            let _ = events.send(SessionEvent::State(ConnState::Closing)).await;
        }

        let handles = shared.slots.lock().unwrap().take_all();
        for handle in handles {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
        }

        let _ = writer.send(WriterCmd::Shutdown).await;

        let reader_abort = reader_task.abort_handle();
        if tokio::time::timeout(cfg.io_timeout, reader_task).await.is_err() {
            reader_abort.abort();
        }
        let writer_abort = writer_task.abort_handle();
        if tokio::time::timeout(cfg.io_timeout, writer_task).await.is_err() {
            writer_abort.abort();
        }

        if shared.set_state(ConnState::Closed) {
            let _ = events.send(SessionEvent::State(ConnState::Closed)).await;
        }
        let _ = events
            .send(SessionEvent::Summary(aggregate.snapshot()))
            .await;

        drop(writer);
        drop(events);
        let _ = events_task.await;
    }

    fn ensure_connected(&self, op: &'static str) -> Result<()> {
        let state = self.state();
        if state != ConnState::Connected {
            return Err(Error::InvalidState { op, state });
        }
        Ok(())
    }
}

/// Owns the sink: the one place outbound frames are written, in order.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<WriterCmd>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(frame) => {
                if let Err(e) = sink.send(Message::Binary(frame.encode().into())).await {
                    warn!(error = %e, "write failed, stopping writer");
                    break;
                }
            }
            WriterCmd::Shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        }
    }
}

/// Owns the stream: decodes each inbound frame once and dispatches it by
/// kind to the run waiting for it.
async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    writer: mpsc::Sender<WriterCmd>,
    events: mpsc::Sender<SessionEvent>,
    clock: Clock,
    chunk_size: usize,
    framing_threshold: u32,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason: Option<String> = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                let received = clock.now();
                match Frame::decode(&data, Some(chunk_size)) {
                    Ok(frame) => dispatch(frame, received, &shared, &writer, clock).await,
                    Err(e) => {
                        let seen = shared.framing_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(error = %e, seen, "discarding malformed frame");
                        let download = shared.routes.lock().unwrap().download.clone();
                        if let Some(download) = download {
                            let _ = download.send(StreamMsg::Corrupt).await;
                        }
                        if seen >= framing_threshold {
                            break Some(format!(
                                "{seen} malformed frames, tearing the connection down"
                            ));
                        }
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Ok(_)) => {} // text frames and ws-level ping/pong are not ours
            Some(Err(e)) => break Some(e.to_string()),
        }
    };

    // connection-level failure or orderly close: either way all runs end here
    let was_closing = matches!(*shared.state.borrow(), ConnState::Closing | ConnState::Closed);
    if shared.set_state(ConnState::Closing) {
        let _ = events.send(SessionEvent::State(ConnState::Closing)).await;
    }
    shared.cancel_runs();
    if shared.set_state(ConnState::Closed) {
        let _ = events.send(SessionEvent::State(ConnState::Closed)).await;
    }
    if let Some(reason) = reason
        && !was_closing
    {
        warn!(%reason, "connection lost");
        let _ = events.send(SessionEvent::ConnectionLost(reason)).await;
    }
}

async fn dispatch(
    frame: Frame,
    received: crate::clock::Micros,
    shared: &Arc<Shared>,
    writer: &mpsc::Sender<WriterCmd>,
    clock: Clock,
) {
    match frame {
        Frame::Ping { t1 } => {
            // answer symmetrically: t3 right before the frame enters the
            // write path
            let pong = Frame::Pong {
                t1,
                t2: received.0,
                t3: clock.now().0,
            };
            let _ = writer.send(WriterCmd::Frame(pong)).await;
        }
        Frame::Pong { t1, t2, t3 } => {
            let pong_route = shared.routes.lock().unwrap().pong.clone();
            if let Some(route) = pong_route {
                let _ = route
                    .send(PongMsg {
                        t1,
                        t2,
                        t3,
                        received,
                    })
                    .await;
            } else {
                debug!(t1, "pong with no probe run active, dropped");
            }
        }
        Frame::Chunk { sequence, payload } => {
            let download = shared.routes.lock().unwrap().download.clone();
            if let Some(route) = download {
                let _ = route
                    .send(StreamMsg::Chunk {
                        sequence,
                        len: CHUNK_OVERHEAD + payload.len(),
                    })
                    .await;
            }
        }
        Frame::RunEnd {
            direction,
            bytes_total,
        } => {
            let route = {
                let routes = shared.routes.lock().unwrap();
                match direction {
                    Direction::Download => routes.download.clone(),
                    Direction::Upload => routes.upload.clone(),
                }
            };
            if let Some(route) = route {
                let _ = route.send(StreamMsg::RunEnd { bytes_total }).await;
            }
        }
        Frame::RunStart { .. } => {
            warn!("unexpected RUN_START from the responder, dropped");
        }
    }
}

/// The single consumer of the sample stream: folds samples into the
/// aggregate and forwards everything to the reporter.
async fn event_loop(
    mut rx: mpsc::Receiver<SessionEvent>,
    aggregate: Arc<Aggregate>,
    mut reporter: Box<dyn Reporter + Send>,
) {
    while let Some(event) = rx.recv().await {
        let result = match event {
            SessionEvent::Latency(sample) => {
                aggregate.record_latency(&sample);
                reporter.on_latency(&sample)
            }
            SessionEvent::ProbeLost => {
                aggregate.record_lost();
                reporter.on_probe_lost()
            }
            SessionEvent::Throughput(sample) => {
                aggregate.record_throughput(&sample);
                reporter.on_throughput(&sample)
            }
            SessionEvent::State(state) => reporter.on_state(state),
            SessionEvent::ConnectionLost(reason) => reporter.on_connection_lost(&reason),
            SessionEvent::Summary(snapshot) => reporter.on_summary(&snapshot),
        };
        if let Err(e) = result {
            debug!(error = %e, "reporter failed, event dropped");
        }
    }
}
