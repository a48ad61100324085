//! The core task.
//!
//! Owns the storage backend, the rule registry, and the ambient
//! temperature context. Every twin mutation in the process funnels
//! through this task's single request loop, which is what serializes
//! the read-evaluate-write cycle per device: while one request is
//! being handled, no other input can slip in between reading a
//! device's inputs and writing its desired state.
//!
//! External surfaces talk to the core over the `client` channel,
//! internal service tasks over the `service` channel. The core also
//! runs the eager override-TTL sweep so that an expiry recalculates
//! the affected devices without waiting for another input to change.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;
use twin_api::{
    client, service,
    types::{
        device::DeviceId,
        overrides::{Override, OverrideCategory, Target},
        twin::ReportedState,
        Error,
    },
    Result,
};

use crate::{
    calc::{self, Outcome},
    config,
    events::Event,
    safety::{rules, Registry, TemperatureReading},
    store::{self, Store},
};

const CHAN_SIZE: usize = 20;

// How often expired overrides are swept out eagerly. Resolution
// correctness doesn't depend on this; the sweep exists so an expiry
// recalculates the device promptly.

const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(1);

// Retry policy for internal store writes racing an optimistic-lock
// conflict.

const RETRY_LIMIT: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

// A cap on how many recalculations one input change may cascade
// into. Interlocked devices feed back into each other; convergence
// is guaranteed because values settle, but a misconfigured rule set
// shouldn't be able to spin the core.

const CASCADE_BUDGET: usize = 64;

/// Holds the state of the core task.
struct State {
    store: Box<dyn Store + Send + Sync>,
    rules: Registry,
    ambient: HashMap<DeviceId, TemperatureReading>,
    bus: broadcast::Sender<Event>,
    dropped_reports: u64,
}

impl State {
    async fn create(
        cfg: &config::Config,
        bus: broadcast::Sender<Event>,
    ) -> Result<Self> {
        let rule_set = rules::load(&cfg.rule_defs);

        info!("loaded {} rules", rule_set.len());

        Ok(State {
            store: Box::new(store::open().await?),
            rules: Registry::new(rule_set, cfg.rule_budget()),
            ambient: HashMap::new(),
            bus,
            dropped_reports: 0,
        })
    }

    async fn recalc_device(&mut self, id: &DeviceId) -> Result<Outcome> {
        calc::recalculate(
            &mut *self.store,
            &self.rules,
            &self.ambient,
            &self.bus,
            id,
        )
        .await
    }

    // Recalculates a set of devices and ripples through their
    // functional systems: whenever a desired state changes, the
    // device's system siblings see a changed related state and get
    // recalculated too.

    async fn recalc_cascade(&mut self, seed: Vec<DeviceId>) {
        let mut work: VecDeque<DeviceId> = seed.into();
        let mut steps = 0;

        while let Some(id) = work.pop_front() {
            if steps >= CASCADE_BUDGET {
                warn!(
                    "recalculation cascade exceeded {} steps at {}; \
		     check the rule set for a feedback loop",
                    CASCADE_BUDGET, &id
                );
                break;
            }
            steps += 1;

            match self.recalc_device(&id).await {
                Ok(Outcome::Updated { .. }) => {
                    if let Ok(Some(sys)) = self.store.system_of(&id).await {
                        for member in sys.devices {
                            if member != id && !work.contains(&member) {
                                work.push_back(member)
                            }
                        }
                    }
                }
                Ok(_) => (),
                Err(e) => {
                    warn!("recalculation of {} failed: {}", &id, &e)
                }
            }
        }
    }

    // The devices affected by an override on `target`.

    async fn affected_by(&mut self, target: &Target) -> Vec<DeviceId> {
        match target {
            Target::Device(id) => vec![id.clone()],
            Target::System(sid) => match self.store.system(sid).await {
                Ok(Some(sys)) => sys.devices,
                Ok(None) => vec![],
                Err(e) => {
                    warn!("couldn't load system {}: {}", sid, &e);
                    vec![]
                }
            },
        }
    }

    async fn handle_client_request(&mut self, req: client::Request) {
        match req {
            client::Request::SetIntent {
                id,
                device_type,
                value,
                requested_by,
                rpy_chan,
            } => {
                let result = self
                    .set_intent(id, device_type, value, requested_by)
                    .await;

                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }

            client::Request::GetTwin { id, rpy_chan } => {
                let result =
                    self.store.twin_snapshot(&id).await.and_then(|snap| {
                        if snap.is_empty() {
                            Err(Error::NotFound)
                        } else {
                            Ok(snap)
                        }
                    });

                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }

            client::Request::DeleteDevice { id, rpy_chan } => {
                let result = self.store.delete_device(&id).await;

                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }

            client::Request::PutOverride { ov, rpy_chan } => {
                let result = self.put_override(ov).await;

                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }

            client::Request::DeleteOverride {
                target,
                category,
                rpy_chan,
            } => {
                let result = self.delete_override(&target, category).await;

                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }

            client::Request::PutSystem { system, rpy_chan } => {
                let result = self.store.put_system(system).await;

                if let Ok(ref sys) = result {
                    self.recalc_cascade(sys.devices.clone()).await
                }
                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }

            client::Request::GetSystem { id, rpy_chan } => {
                let result = self
                    .store
                    .system(&id)
                    .await
                    .and_then(|v| v.ok_or(Error::NotFound));

                if rpy_chan.send(result).is_err() {
                    warn!("client exited before a reply could be sent")
                }
            }
        }
    }

    async fn set_intent(
        &mut self,
        id: DeviceId,
        device_type: twin_api::types::device::DeviceType,
        value: twin_api::types::device::Value,
        requested_by: String,
    ) -> Result<client::IntentOutcome> {
        use twin_api::types::twin::UserIntent;

        // Sensors admit no intent; this is the API boundary that
        // rejects them.

        if !device_type.is_output() {
            return Err(Error::InvArgument(String::from(
                "temperature sensors don't accept intents",
            )));
        }
        value.validate_for(device_type)?;

        // The intent must agree with whatever type the device already
        // has on record.

        let snapshot = self.store.twin_snapshot(&id).await?;

        if let Some(existing) = calc::device_type_of(&snapshot) {
            if existing != device_type {
                return Err(Error::InvArgument(format!(
                    "device {} is a {}, not a {}",
                    &id, existing, device_type
                )));
            }
        }

        // Save the input first; only then may a recalculation run.

        self.store
            .save_intent(UserIntent {
                id: id.clone(),
                device_type,
                value,
                requested_at: chrono::Utc::now(),
                requested_by,
            })
            .await
            .map_err(infra_error)?;

        let outcome =
            self.recalc_device(&id).await.map_err(infra_error)?;

        // Ripple to system siblings after the device itself settled.

        if matches!(outcome, Outcome::Updated { .. }) {
            if let Ok(Some(sys)) = self.store.system_of(&id).await {
                let siblings = sys
                    .devices
                    .into_iter()
                    .filter(|m| *m != id)
                    .collect();

                self.recalc_cascade(siblings).await
            }
        }

        match outcome {
            Outcome::Refused { rule, reason } => {
                Err(Error::SafetyBlock(rule, reason))
            }

            Outcome::Updated {
                state,
                modified_by: Some(rule),
            } => Ok(client::IntentOutcome::Modified {
                value: state.value,
                rule,
            }),

            Outcome::Unchanged {
                value,
                modified_by: Some(rule),
            } => Ok(client::IntentOutcome::Modified { value, rule }),

            Outcome::Updated {
                state,
                modified_by: None,
            } => {
                let _ = self.bus.send(Event::IntentAccepted {
                    id,
                    value: state.value,
                });
                Ok(client::IntentOutcome::Accepted)
            }

            Outcome::Unchanged {
                value,
                modified_by: None,
            } => {
                let _ = self.bus.send(Event::IntentAccepted { id, value });
                Ok(client::IntentOutcome::Accepted)
            }

            Outcome::Skipped => Ok(client::IntentOutcome::Accepted),
        }
    }

    async fn put_override(&mut self, ov: Override) -> Result<Override> {
        // A device-scoped override must fit the device it targets.

        if let Target::Device(ref id) = ov.target {
            let snapshot = self.store.twin_snapshot(id).await?;

            if let Some(existing) = calc::device_type_of(&snapshot) {
                ov.value.validate_for(existing).map_err(|_| {
                    Error::InvArgument(format!(
                        "override value {} doesn't fit device {}",
                        ov.value, id
                    ))
                })?;
            }
        }

        let stored = self.store.put_override(ov).await?;

        let _ = self.bus.send(Event::OverrideApplied {
            target: stored.target.clone(),
            category: stored.category,
        });

        let affected = self.affected_by(&stored.target).await;

        self.recalc_cascade(affected).await;
        Ok(stored)
    }

    async fn delete_override(
        &mut self,
        target: &Target,
        category: OverrideCategory,
    ) -> Result<()> {
        self.store.delete_override(target, category).await?;

        let _ = self.bus.send(Event::OverrideCancelled {
            target: target.clone(),
            category,
        });

        let affected = self.affected_by(target).await;

        self.recalc_cascade(affected).await;
        Ok(())
    }

    async fn handle_service_request(&mut self, req: service::Request) {
        match req {
            service::Request::ReportState { state } => {
                self.report_state(state).await
            }

            service::Request::ReportTemperature {
                id,
                celsius,
                is_error,
            } => {
                self.ambient.insert(
                    id,
                    TemperatureReading {
                        celsius,
                        is_error,
                        received_at: chrono::Utc::now(),
                    },
                );
            }

            service::Request::Snapshot { id, rpy_chan } => {
                if rpy_chan
                    .send(self.store.twin_snapshot(&id).await)
                    .is_err()
                {
                    warn!("service exited before a reply could be sent")
                }
            }

            service::Request::ActiveOutputs { rpy_chan } => {
                if rpy_chan
                    .send(self.store.active_output_devices().await)
                    .is_err()
                {
                    warn!("service exited before a reply could be sent")
                }
            }

            service::Request::IndexedDevices { rpy_chan } => {
                if rpy_chan
                    .send(self.store.indexed_devices().await)
                    .is_err()
                {
                    warn!("service exited before a reply could be sent")
                }
            }

            service::Request::LastActivity { id, rpy_chan } => {
                if rpy_chan
                    .send(self.store.last_activity(&id).await)
                    .is_err()
                {
                    warn!("service exited before a reply could be sent")
                }
            }

            service::Request::RemoveFromIndex { id, rpy_chan } => {
                if rpy_chan
                    .send(self.store.remove_from_index(&id).await)
                    .is_err()
                {
                    warn!("service exited before a reply could be sent")
                }
            }

            service::Request::Ping { rpy_chan } => {
                if rpy_chan.send(self.store.ping().await).is_err() {
                    warn!("service exited before a reply could be sent")
                }
            }
        }
    }

    async fn report_state(&mut self, state: ReportedState) {
        let id = state.id.clone();

        // A report whose type disagrees with the stored records is
        // noise from a reconfigured controller; dropping it beats
        // poisoning the twin.

        match self.store.twin_snapshot(&id).await {
            Ok(snapshot) => {
                if let Some(existing) = calc::device_type_of(&snapshot) {
                    if existing != state.device_type {
                        self.dropped_reports += 1;
                        warn!(
                            "dropping {} report for {} device {} ({} \
			     dropped so far)",
                            state.device_type,
                            existing,
                            &id,
                            self.dropped_reports
                        );
                        return;
                    }
                }

                let was_converged = snapshot.is_converged();

                if let Err(e) = self.store.save_reported(state.clone()).await
                {
                    self.dropped_reports += 1;
                    warn!("couldn't save report for {}: {}", &id, &e);
                    return;
                }

                let _ = self.bus.send(Event::ReportedChanged {
                    id: id.clone(),
                    value: state.value,
                });

                let now_converged = twin_api::types::twin::TwinSnapshot {
                    reported: Some(state),
                    ..snapshot
                }
                .is_converged();

                if was_converged != now_converged {
                    let _ = self.bus.send(if now_converged {
                        Event::Converged { id: id.clone() }
                    } else {
                        Event::Diverged { id: id.clone() }
                    });
                }

                // A report is a related-state change for the system
                // and can give a fresh device its type, so the device
                // and its siblings all reconsider.

                self.recalc_cascade(vec![id]).await
            }
            Err(e) => {
                self.dropped_reports += 1;
                warn!("couldn't read twin of {}: {}", &id, &e)
            }
        }
    }

    // Deletes expired overrides and lets the affected devices fall
    // back to the next layer. The resolver never applies an expired
    // override; this sweep only makes the fallback prompt.

    async fn sweep_expired(&mut self) {
        let expired = match self.store.expired_overrides().await {
            Ok(v) => v,
            Err(e) => {
                warn!("couldn't list expired overrides: {}", &e);
                return;
            }
        };

        for ov in expired {
            let mut attempt = 0;

            let deleted = loop {
                match self
                    .store
                    .delete_override(&ov.target, ov.category)
                    .await
                {
                    Ok(()) => break true,

                    // Someone beat the sweep to it; that's fine.
                    Err(Error::NotFound) => break false,

                    Err(Error::VersionConflict)
                        if attempt < RETRY_LIMIT =>
                    {
                        attempt += 1;
                        time::sleep(RETRY_BACKOFF * 2u32.pow(attempt))
                            .await
                    }

                    Err(e) => {
                        warn!(
                            "couldn't evict expired override on {}: {}",
                            &ov.target, &e
                        );
                        break false;
                    }
                }
            };

            if deleted {
                info!(
                    "override {} on {} expired",
                    ov.category, &ov.target
                );

                let _ = self.bus.send(Event::OverrideExpired {
                    target: ov.target.clone(),
                    category: ov.category,
                });

                let affected = self.affected_by(&ov.target).await;

                self.recalc_cascade(affected).await
            }
        }
    }

    /// Captures the State and runs as an async task using it as its
    /// mutable state. Normally it is run as a background task using
    /// `task::spawn`.
    async fn run(
        mut self,
        mut rx_client: mpsc::Receiver<client::Request>,
        mut rx_service: mpsc::Receiver<service::Request>,
    ) -> Result<Infallible> {
        let mut sweep = time::interval(EXPIRY_SWEEP_PERIOD);

        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("starting");

        loop {
            #[rustfmt::skip]
            tokio::select! {
		req = rx_client.recv() => match req {
		    Some(req) =>
			self.handle_client_request(req)
			    .instrument(info_span!("client_req"))
			    .await,
		    None => break
		},
		req = rx_service.recv() => match req {
		    Some(req) =>
			self.handle_service_request(req)
			    .instrument(info_span!("service_req"))
			    .await,
		    None => break
		},
		_ = sweep.tick() =>
		    self.sweep_expired()
			.instrument(info_span!("expiry"))
			.await,
            }
        }

        const ERR_MSG: &str = "no clients or services left";

        warn!(ERR_MSG);
        Err(Error::MissingPeer(ERR_MSG.to_string()))
    }
}

// When the storage layer fails underneath an intent, the caller sees
// the infrastructure being down, not a bare backend error.

fn infra_error(e: Error) -> Error {
    match e {
        Error::BackendError(_) | Error::TimeoutError => Error::InfraDown,
        e => e,
    }
}

/// Starts the core task. Returns the client and service request
/// handles and the task handle; events go out on the bus the caller
/// supplied.

pub async fn start(
    cfg: &config::Config,
    bus: broadcast::Sender<Event>,
) -> Result<(
    client::RequestChan,
    service::RequestChan,
    JoinHandle<Result<Infallible>>,
)> {
    let (tx_client, rx_client) = mpsc::channel(CHAN_SIZE);
    let (tx_service, rx_service) = mpsc::channel(CHAN_SIZE);
    let state = State::create(cfg, bus).await?;

    Ok((
        client::RequestChan::new(tx_client),
        service::RequestChan::new(tx_service),
        tokio::spawn(async {
            state
                .run(rx_client, rx_service)
                .instrument(info_span!("core"))
                .await
        }),
    ))
}
