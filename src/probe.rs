//! Latency probe engine.
//!
//! Issues `PING{t1}` on a fixed cadence and matches each `PONG{t1, t2, t3}`
//! back to its probe by the echoed `t1`, never by arrival order. A probe
//! with no reply within the timeout is recorded as lost and excluded from
//! aggregation; the schedule keeps going regardless, and regardless of any
//! concurrent stream run. Each completed sample carries an `under_load` flag
//! captured when its PING was sent.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::clock::{Clock, Micros};
use crate::frame::Frame;
use crate::sample::LatencySample;
use crate::session::{SessionEvent, WriterCmd};

/// A dispatched PONG, timestamped at the moment the reader pulled it off the
/// wire so queueing behind the dispatcher does not inflate the RTT.
pub(crate) struct PongMsg {
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
    pub received: Micros,
}

struct PendingProbe {
    deadline: Instant,
    under_load: bool,
}

/// Drive the probe schedule until stopped or the connection goes away.
pub(crate) async fn run(
    clock: Clock,
    interval: Duration,
    timeout: Duration,
    writer: mpsc::Sender<WriterCmd>,
    mut pongs: mpsc::Receiver<PongMsg>,
    load: Arc<AtomicUsize>,
    events: mpsc::Sender<SessionEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut pending: HashMap<u64, PendingProbe> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let next_expiry = pending.values().map(|p| p.deadline).min();

        tokio::select! {
            _ = ticker.tick() => {
                let t1 = clock.now();
                let under_load = load.load(Ordering::Relaxed) > 0;
                if writer.send(WriterCmd::Frame(Frame::Ping { t1: t1.0 })).await.is_err() {
                    break;
                }
                trace!(t1 = t1.0, under_load, "probe sent");
                pending.insert(t1.0, PendingProbe {
                    deadline: Instant::now() + timeout,
                    under_load,
                });
            }
            msg = pongs.recv() => {
                match msg {
                    Some(pong) => {
                        if let Some(probe) = pending.remove(&pong.t1) {
                            let sample = LatencySample::derive(
                                Micros(pong.t1),
                                Micros(pong.t2),
                                Micros(pong.t3),
                                pong.received,
                                probe.under_load,
                            );
                            if events.send(SessionEvent::Latency(sample)).await.is_err() {
                                break;
                            }
                        } else {
                            // reply to a probe already marked lost
                            debug!(t1 = pong.t1, "stale pong dropped");
                        }
                    }
                    None => break,
                }
            }
            _ = crate::stream::sleep_until_opt(next_expiry) => {
                let now = Instant::now();
                let expired: Vec<u64> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(t1, _)| *t1)
                    .collect();
                for t1 in expired {
                    pending.remove(&t1);
                    debug!(t1, "probe lost");
                    if events.send(SessionEvent::ProbeLost).await.is_err() {
                        return;
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;

    struct Harness {
        writer_rx: mpsc::Receiver<WriterCmd>,
        pong_tx: mpsc::Sender<PongMsg>,
        event_rx: mpsc::Receiver<SessionEvent>,
        stop: watch::Sender<bool>,
        clock: Clock,
    }

    fn spawn_probe(interval: Duration, timeout: Duration) -> Harness {
        let clock = Clock::new();
        let (writer_tx, writer_rx) = mpsc::channel(16);
        let (pong_tx, pong_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run(
            clock,
            interval,
            timeout,
            writer_tx,
            pong_rx,
            Arc::new(AtomicUsize::new(0)),
            event_tx,
            stop_rx,
        ));
        Harness {
            writer_rx,
            pong_tx,
            event_rx,
            stop: stop_tx,
            clock,
        }
    }

    async fn next_ping(h: &mut Harness) -> u64 {
        match h.writer_rx.recv().await.unwrap() {
            WriterCmd::Frame(Frame::Ping { t1 }) => t1,
            other => panic!("unexpected writer command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn answered_probe_produces_sample() {
        let mut h = spawn_probe(Duration::from_millis(5), Duration::from_secs(1));

        let t1 = next_ping(&mut h).await;
        h.pong_tx
            .send(PongMsg {
                t1,
                t2: 100,
                t3: 400,
                received: h.clock.now(),
            })
            .await
            .unwrap();

        match h.event_rx.recv().await.unwrap() {
            SessionEvent::Latency(sample) => {
                assert_eq!(sample.responder_processing, Duration::from_micros(300));
                assert!(sample.round_trip >= sample.one_way);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let _ = h.stop.send(true);
    }

    #[tokio::test]
    async fn unanswered_probe_is_lost() {
        let mut h = spawn_probe(Duration::from_secs(60), Duration::from_millis(20));

        let _t1 = next_ping(&mut h).await;
        match h.event_rx.recv().await.unwrap() {
            SessionEvent::ProbeLost => {}
            other => panic!("unexpected event: {other:?}"),
        }
        let _ = h.stop.send(true);
    }

    #[tokio::test]
    async fn pongs_match_by_nonce_not_arrival_order() {
        let mut h = spawn_probe(Duration::from_millis(5), Duration::from_secs(5));

        let first = next_ping(&mut h).await;
        let second = next_ping(&mut h).await;
        assert!(second > first);

        // answer out of order
        for t1 in [second, first] {
            h.pong_tx
                .send(PongMsg {
                    t1,
                    t2: 0,
                    t3: 0,
                    received: h.clock.now(),
                })
                .await
                .unwrap();
        }

        for _ in 0..2 {
            match h.event_rx.recv().await.unwrap() {
                SessionEvent::Latency(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        let _ = h.stop.send(true);
    }

    #[tokio::test]
    async fn stale_pong_after_timeout_is_dropped() {
        let mut h = spawn_probe(Duration::from_secs(60), Duration::from_millis(10));

        let t1 = next_ping(&mut h).await;
        match h.event_rx.recv().await.unwrap() {
            SessionEvent::ProbeLost => {}
            other => panic!("unexpected event: {other:?}"),
        }

        h.pong_tx
            .send(PongMsg {
                t1,
                t2: 0,
                t3: 0,
                received: h.clock.now(),
            })
            .await
            .unwrap();

        // the stale reply must not turn into a sample
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.event_rx.try_recv().is_err());
        let _ = h.stop.send(true);
    }

    #[tokio::test]
    async fn stop_is_observed() {
        let mut h = spawn_probe(Duration::from_millis(5), Duration::from_secs(1));
        let _ = next_ping(&mut h).await;
        let _ = h.stop.send(true);
        // engine exits and drops its event sender
        while h.event_rx.recv().await.is_some() {}
    }
}
