//! The infrastructure health gate.
//!
//! Periodically probes the storage layer through the core. A run of
//! consecutive failures trips the gate; a shorter run of consecutive
//! successes closes it again. Both reconcilers read the gate through
//! a `watch` channel before emitting any command: while it is open
//! the control plane goes quiet and devices are on their own
//! fail-safes.

use chrono::Utc;
use std::convert::Infallible;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;
use twin_api::{service, types::Error, Result};

use crate::events::Event;

const COMPONENT: &str = "twin-store";

/// The debounced health state machine. A single blip in either
/// direction never changes the verdict.
pub struct Monitor {
    healthy: bool,
    failures: u32,
    successes: u32,
    failure_threshold: u32,
    recovery_threshold: u32,
}

impl Monitor {
    /// Starts out healthy; the gate shouldn't block commands before
    /// the store had a chance to answer a single probe.
    pub fn new(failure_threshold: u32, recovery_threshold: u32) -> Monitor {
        Monitor {
            healthy: true,
            failures: 0,
            successes: 0,
            failure_threshold,
            recovery_threshold,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Feeds one probe result in. Returns the new state when the
    /// verdict flipped.
    pub fn observe(&mut self, ok: bool) -> Option<bool> {
        if ok {
            self.successes += 1;
            self.failures = 0;

            if !self.healthy && self.successes >= self.recovery_threshold {
                self.healthy = true;
                return Some(true);
            }
        } else {
            self.failures += 1;
            self.successes = 0;

            if self.healthy && self.failures >= self.failure_threshold {
                self.healthy = false;
                return Some(false);
            }
        }
        None
    }
}

struct Gate {
    monitor: Monitor,
    probe_period: Duration,
    probe_timeout: Duration,
    chan: service::RequestChan,
    state: watch::Sender<bool>,
    bus: broadcast::Sender<Event>,
}

impl Gate {
    async fn probe(&self) -> Result<()> {
        match time::timeout(self.probe_timeout, self.chan.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimeoutError),
        }
    }

    async fn run(mut self) -> Result<Infallible> {
        let mut interval = time::interval(self.probe_period);

        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("starting");

        loop {
            let _ = interval.tick().await;

            let result = self.probe().await;
            let ok = result.is_ok();

            if let Some(healthy) = self.monitor.observe(ok) {
                if healthy {
                    info!("storage recovered; command emission resumes");
                } else {
                    let message = result
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| String::from("unreachable"));

                    error!("storage unhealthy: {}", &message);

                    let _ = self.bus.send(Event::InfrastructureFailure {
                        component: String::from(COMPONENT),
                        message,
                        failed_at: Utc::now(),
                    });
                }

                if self.state.send(healthy).is_err() {
                    warn!("nobody is watching the health gate")
                }
            }
        }
    }
}

/// Starts the gate. Returns the `watch` handle the reconcilers read
/// and the task handle.
pub fn start(
    failure_threshold: u32,
    recovery_threshold: u32,
    probe_period: Duration,
    probe_timeout: Duration,
    chan: service::RequestChan,
    bus: broadcast::Sender<Event>,
) -> (watch::Receiver<bool>, JoinHandle<Result<Infallible>>) {
    let (tx, rx) = watch::channel(true);
    let gate = Gate {
        monitor: Monitor::new(failure_threshold, recovery_threshold),
        probe_period,
        probe_timeout,
        chan,
        state: tx,
        bus,
    };

    (
        rx,
        tokio::spawn(gate.run().instrument(info_span!("health"))),
    )
}
