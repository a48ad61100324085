//! The drift reconciler.
//!
//! A periodic sweep over the active-output index that re-emits the
//! command for any twin that hasn't converged. The immediate
//! reconciler is event-driven; this sweep is the backstop for the
//! events it never saw (a bus hiccup, a device that rebooted and
//! forgot its state). Devices that vanished from under their index
//! entry are left for the maintenance jobs to clean up.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;
use twin_api::{service, Result};

use super::Metrics;
use crate::proto::DeviceCommand;

pub struct Sweeper {
    period: Duration,
    store_timeout: Duration,
    publish_timeout: Duration,
    chan: service::RequestChan,
    healthy: watch::Receiver<bool>,
    commands: mpsc::Sender<DeviceCommand>,
    metrics: Arc<Metrics>,
}

impl Sweeper {
    async fn sweep(&self) {
        let outputs = match time::timeout(
            self.store_timeout,
            self.chan.active_outputs(),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!("couldn't list active outputs: {}", &e);
                return;
            }
            Err(_) => {
                warn!("timed out listing active outputs");
                return;
            }
        };

        for state in outputs {
            let snapshot = match time::timeout(
                self.store_timeout,
                self.chan.snapshot(state.id.clone()),
            )
            .await
            {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!("couldn't read twin of {}: {}", &state.id, &e);
                    continue;
                }
                Err(_) => {
                    warn!("timed out reading twin of {}", &state.id);
                    continue;
                }
            };

            // An index entry without a twin is an orphan; not our
            // job.

            if snapshot.is_empty() || snapshot.is_converged() {
                continue;
            }

            let Some(desired) = snapshot.desired else {
                continue;
            };

            debug!("re-driving diverged device {}", &desired.id);

            let cmd = DeviceCommand {
                id: desired.id.clone(),
                device_type: desired.device_type,
                value: desired.value,
            };

            match time::timeout(
                self.publish_timeout,
                self.commands.send(cmd),
            )
            .await
            {
                Ok(Ok(())) => {
                    self.metrics.drift_sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(_)) => {
                    warn!("command channel closed; {} not set", &desired.id)
                }
                Err(_) => {
                    warn!("timed out publishing command for {}", &desired.id)
                }
            }
        }
    }

    async fn run(self) -> Result<Infallible> {
        let mut interval = time::interval(self.period);

        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("starting");

        loop {
            let _ = interval.tick().await;

            // Fail-stop: while the gate is open, the sweep doesn't
            // even look.

            if !*self.healthy.borrow() {
                debug!("skipping sweep: infrastructure unhealthy");
                continue;
            }
            self.sweep().await
        }
    }
}

pub fn start(
    period: Duration,
    store_timeout: Duration,
    publish_timeout: Duration,
    chan: service::RequestChan,
    healthy: watch::Receiver<bool>,
    commands: mpsc::Sender<DeviceCommand>,
    metrics: Arc<Metrics>,
) -> JoinHandle<Result<Infallible>> {
    let sweeper = Sweeper {
        period,
        store_timeout,
        publish_timeout,
        chan,
        healthy,
        commands,
        metrics,
    };

    tokio::spawn(sweeper.run().instrument(info_span!("drift")))
}
