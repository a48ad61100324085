//! The immediate reconciler.
//!
//! Listens for newly calculated desired states and turns them into
//! outbound device commands. Each device gets a debounce window: a
//! burst of recalculations collapses into one command carrying the
//! final value. Before anything is sent, the infrastructure health
//! gate and the twin's convergence are checked; an unhealthy store or
//! an already-converged twin suppresses the command.
//!
//! The whole reconciler is one task. Scheduling, cancellation, and
//! firing all happen on its single thread of control, which makes the
//! compare-and-cancel on the pending map atomic by construction. A
//! superseded timer entry notices its stale generation when it pops
//! and does nothing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;
use twin_api::{
    service,
    types::{
        device::{DeviceId, Value},
        Error,
    },
    Result,
};

use crate::{events::Event, proto::DeviceCommand};

pub mod drift;

/// Counters shared by both reconcilers. They are cheap to bump and
/// exist so operators (and the test suite) can see what the
/// reconcilers decided.
#[derive(Default)]
pub struct Metrics {
    /// Pending dispatches cancelled by a newer value.
    pub debounced: AtomicU64,

    /// Dispatches suppressed by the health gate.
    pub skipped_unhealthy: AtomicU64,

    /// Dispatches suppressed because the twin had converged.
    pub skipped_converged: AtomicU64,

    /// Commands actually emitted by the immediate reconciler.
    pub sent: AtomicU64,

    /// Commands emitted by the drift sweep.
    pub drift_sent: AtomicU64,

    /// Dispatches lost to store or transport trouble.
    pub errors: AtomicU64,
}

struct Pending {
    value: Value,
    gen: u64,
}

pub struct Reconciler {
    window: Duration,
    store_timeout: Duration,
    publish_timeout: Duration,
    pending: HashMap<DeviceId, Pending>,
    queue: BinaryHeap<Reverse<(Instant, u64, DeviceId)>>,
    next_gen: u64,
    chan: service::RequestChan,
    healthy: watch::Receiver<bool>,
    commands: mpsc::Sender<DeviceCommand>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    fn new(
        window: Duration,
        store_timeout: Duration,
        publish_timeout: Duration,
        chan: service::RequestChan,
        healthy: watch::Receiver<bool>,
        commands: mpsc::Sender<DeviceCommand>,
        metrics: Arc<Metrics>,
    ) -> Reconciler {
        Reconciler {
            window,
            store_timeout,
            publish_timeout,
            pending: HashMap::new(),
            queue: BinaryHeap::new(),
            next_gen: 0,
            chan,
            healthy,
            commands,
            metrics,
        }
    }

    // Schedules (or reschedules) a dispatch for the device. The
    // generation counter is what makes cancellation work: the heap
    // may hold several entries for the same device but only the one
    // matching the pending record's generation may fire.

    fn schedule(&mut self, id: DeviceId, value: Value) {
        self.next_gen += 1;

        let gen = self.next_gen;

        if self
            .pending
            .insert(id.clone(), Pending { value, gen })
            .is_some()
        {
            self.metrics.debounced.fetch_add(1, Ordering::Relaxed);
        }
        self.queue
            .push(Reverse((Instant::now() + self.window, gen, id)))
    }

    async fn dispatch(&mut self, id: DeviceId, pending: Pending) {
        if !*self.healthy.borrow() {
            debug!("skipping {}: infrastructure unhealthy", &id);
            self.metrics.skipped_unhealthy.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let snapshot = match time::timeout(
            self.store_timeout,
            self.chan.snapshot(id.clone()),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!("couldn't read twin of {}: {}", &id, &e);
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                warn!("timed out reading twin of {}", &id);
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if snapshot.is_converged() {
            debug!("skipping {}: already converged", &id);
            self.metrics.skipped_converged.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Send whatever the store says is desired *now*; it can only
        // be newer than the value that scheduled this dispatch. A
        // twin whose desired state vanished (device deleted) gets
        // nothing.

        let Some(desired) = snapshot.desired else {
            debug!(
                "skipping {}: desired state (was {}) no longer exists",
                &id, pending.value
            );
            return;
        };

        let cmd = DeviceCommand {
            id: id.clone(),
            device_type: desired.device_type,
            value: desired.value,
        };

        match time::timeout(self.publish_timeout, self.commands.send(cmd))
            .await
        {
            Ok(Ok(())) => {
                self.metrics.sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(_)) => {
                warn!("command channel closed; {} not set", &id);
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!("timed out publishing command for {}", &id);
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Fires every queue entry that is due. Stale generations are
    // discarded silently; that's a cancelled dispatch observing its
    // cancellation.

    async fn fire_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, gen, id))) =
            self.queue.peek().cloned()
        {
            if deadline > now {
                break;
            }
            let _ = self.queue.pop();

            let current =
                matches!(self.pending.get(&id), Some(p) if p.gen == gen);

            if current {
                if let Some(pending) = self.pending.remove(&id) {
                    self.dispatch(id, pending).await
                }
            }
        }
    }

    async fn run(
        mut self,
        events: broadcast::Receiver<Event>,
    ) -> Result<Infallible> {
        let mut events = BroadcastStream::new(events);

        info!("starting");
        loop {
            let next =
                self.queue.peek().map(|Reverse((dl, _, _))| *dl);
            let deadline = next.unwrap_or_else(Instant::now);

            #[rustfmt::skip]
            tokio::select! {
                ev = events.next() => match ev {
                    Some(Ok(Event::DesiredCalculated { id, value })) =>
                        self.schedule(id, value),
                    Some(Ok(_)) => (),
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) =>
                        warn!("event bus overran us; lost {} events", n),
                    None =>
                        return Err(Error::MissingPeer(
                            "event bus closed".to_string(),
                        )),
                },

                _ = time::sleep_until(deadline), if next.is_some() =>
                    self.fire_due(Instant::now()).await,
            }
        }
    }
}

/// Starts the immediate reconciler. Returns its counters and the
/// task handle.
pub fn start(
    window: Duration,
    store_timeout: Duration,
    publish_timeout: Duration,
    chan: service::RequestChan,
    events: broadcast::Receiver<Event>,
    healthy: watch::Receiver<bool>,
    commands: mpsc::Sender<DeviceCommand>,
) -> (Arc<Metrics>, JoinHandle<Result<Infallible>>) {
    let metrics = Arc::new(Metrics::default());
    let actor = Reconciler::new(
        window,
        store_timeout,
        publish_timeout,
        chan,
        healthy,
        commands,
        metrics.clone(),
    );

    (
        metrics,
        tokio::spawn(
            actor.run(events).instrument(info_span!("reconciler")),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use twin_api::types::twin::{
        DesiredState, ReportedState, SourceCategory, TwinSnapshot,
    };

    const WINDOW: Duration = Duration::from_millis(50);

    fn desired(id: &DeviceId, v: Value) -> DesiredState {
        DesiredState {
            id: id.clone(),
            device_type: v.device_type(),
            value: v,
            reason: String::from("test"),
            calculated_at: Utc::now(),
            source: SourceCategory::UserIntent,
        }
    }

    fn reported(id: &DeviceId, v: Value) -> ReportedState {
        ReportedState {
            id: id.clone(),
            device_type: v.device_type(),
            value: v,
            received_at: Utc::now(),
            is_known: true,
        }
    }

    // A stand-in core that answers snapshot requests from a fixed
    // table. The real core would read its store; the reconciler can't
    // tell the difference.

    fn fake_core(
        snapshots: HashMap<DeviceId, TwinSnapshot>,
    ) -> service::RequestChan {
        let (tx, mut rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                match req {
                    service::Request::Snapshot { id, rpy_chan } => {
                        let _ = rpy_chan.send(Ok(snapshots
                            .get(&id)
                            .cloned()
                            .unwrap_or_default()));
                    }
                    _ => panic!("unexpected request"),
                }
            }
        });

        service::RequestChan::new(tx)
    }

    struct Fixture {
        bus: broadcast::Sender<Event>,
        healthy: watch::Sender<bool>,
        commands: mpsc::Receiver<DeviceCommand>,
        metrics: Arc<Metrics>,
    }

    fn start_fixture(
        snapshots: HashMap<DeviceId, TwinSnapshot>,
    ) -> Fixture {
        let (bus, events) = broadcast::channel(16);
        let (tx_health, rx_health) = watch::channel(true);
        let (tx_cmd, rx_cmd) = mpsc::channel(16);
        let (metrics, _task) = start(
            WINDOW,
            Duration::from_millis(1_000),
            Duration::from_millis(2_000),
            fake_core(snapshots),
            events,
            rx_health,
            tx_cmd,
        );

        Fixture {
            bus,
            healthy: tx_health,
            commands: rx_cmd,
            metrics,
        }
    }

    // Lets the paused clock run past the debounce window.

    async fn settle() {
        time::sleep(WINDOW + Duration::from_millis(10)).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_to_command() {
        let id: DeviceId = "c1:r1".parse().unwrap();
        let snap = TwinSnapshot {
            desired: Some(desired(&id, Value::Relay(true))),
            ..TwinSnapshot::default()
        };
        let mut fx =
            start_fixture(HashMap::from([(id.clone(), snap)]));

        fx.bus
            .send(Event::DesiredCalculated {
                id: id.clone(),
                value: Value::Relay(true),
            })
            .unwrap();

        settle().await;

        let cmd = fx.commands.try_recv().unwrap();

        assert_eq!(cmd.routing_key(), ".c1.digital_output.r1.set");
        assert_eq!(cmd.payload(), "{\"state\":\"1\"}");

        // Exactly one command.

        assert!(fx.commands.try_recv().is_err());
        assert_eq!(fx.metrics.sent.load(Ordering::Relaxed), 1);
        assert_eq!(fx.metrics.debounced.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_bursts() {
        let id: DeviceId = "c1:f1".parse().unwrap();
        let snap = TwinSnapshot {
            desired: Some(desired(&id, Value::Fan(2))),
            ..TwinSnapshot::default()
        };
        let mut fx =
            start_fixture(HashMap::from([(id.clone(), snap)]));

        // Three updates inside one window.

        for v in [1u8, 3, 2] {
            fx.bus
                .send(Event::DesiredCalculated {
                    id: id.clone(),
                    value: Value::Fan(v),
                })
                .unwrap();
            time::sleep(Duration::from_millis(10)).await;
        }

        settle().await;

        let cmd = fx.commands.try_recv().unwrap();

        assert_eq!(cmd.payload(), "2");
        assert!(fx.commands.try_recv().is_err());
        assert_eq!(fx.metrics.debounced.load(Ordering::Relaxed), 2);
        assert_eq!(fx.metrics.sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_gate_suppresses_commands() {
        let id: DeviceId = "c1:r1".parse().unwrap();
        let snap = TwinSnapshot {
            desired: Some(desired(&id, Value::Relay(true))),
            ..TwinSnapshot::default()
        };
        let mut fx =
            start_fixture(HashMap::from([(id.clone(), snap)]));

        fx.healthy.send(false).unwrap();
        fx.bus
            .send(Event::DesiredCalculated {
                id: id.clone(),
                value: Value::Relay(true),
            })
            .unwrap();

        settle().await;

        assert!(fx.commands.try_recv().is_err());
        assert_eq!(
            fx.metrics.skipped_unhealthy.load(Ordering::Relaxed),
            1
        );
        assert_eq!(fx.metrics.sent.load(Ordering::Relaxed), 0);

        // Back to healthy, the next event flows again.

        fx.healthy.send(true).unwrap();
        fx.bus
            .send(Event::DesiredCalculated {
                id: id.clone(),
                value: Value::Relay(true),
            })
            .unwrap();

        settle().await;

        assert!(fx.commands.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_converged_twin_is_left_alone() {
        let id: DeviceId = "c1:r1".parse().unwrap();
        let snap = TwinSnapshot {
            desired: Some(desired(&id, Value::Relay(true))),
            reported: Some(reported(&id, Value::Relay(true))),
            ..TwinSnapshot::default()
        };
        let mut fx =
            start_fixture(HashMap::from([(id.clone(), snap)]));

        fx.bus
            .send(Event::DesiredCalculated {
                id: id.clone(),
                value: Value::Relay(true),
            })
            .unwrap();

        settle().await;

        assert!(fx.commands.try_recv().is_err());
        assert_eq!(
            fx.metrics.skipped_converged.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_device_is_skipped() {
        let id: DeviceId = "c9:gone".parse().unwrap();
        let mut fx = start_fixture(HashMap::new());

        fx.bus
            .send(Event::DesiredCalculated {
                id: id.clone(),
                value: Value::Relay(true),
            })
            .unwrap();

        settle().await;

        assert!(fx.commands.try_recv().is_err());
        assert_eq!(fx.metrics.sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_debounce_independently() {
        let r1: DeviceId = "c1:r1".parse().unwrap();
        let r2: DeviceId = "c1:r2".parse().unwrap();
        let snaps = HashMap::from([
            (
                r1.clone(),
                TwinSnapshot {
                    desired: Some(desired(&r1, Value::Relay(true))),
                    ..TwinSnapshot::default()
                },
            ),
            (
                r2.clone(),
                TwinSnapshot {
                    desired: Some(desired(&r2, Value::Relay(false))),
                    ..TwinSnapshot::default()
                },
            ),
        ]);
        let mut fx = start_fixture(snaps);

        fx.bus
            .send(Event::DesiredCalculated {
                id: r1.clone(),
                value: Value::Relay(true),
            })
            .unwrap();
        fx.bus
            .send(Event::DesiredCalculated {
                id: r2.clone(),
                value: Value::Relay(false),
            })
            .unwrap();

        settle().await;

        // One command each; neither device cancelled the other.

        let mut keys = vec![
            fx.commands.try_recv().unwrap().routing_key(),
            fx.commands.try_recv().unwrap().routing_key(),
        ];

        keys.sort();
        assert_eq!(
            keys,
            vec![
                String::from(".c1.digital_output.r1.set"),
                String::from(".c1.digital_output.r2.set"),
            ]
        );
        assert_eq!(fx.metrics.debounced.load(Ordering::Relaxed), 0);
    }
}
