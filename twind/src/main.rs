#![deny(unsafe_code)]

use futures::future;
use std::convert::Infallible;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn, Instrument};
use twin_api::{types::Error, Result};

mod calc;
mod config;
mod core;
mod events;
mod health;
mod maintenance;
mod proto;
mod reconcile;
mod safety;
mod store;

// Initializes the `twind` application. It determines the
// configuration and sets up the logger. It returns `Some(Config)`
// with the found configuration, if the application is to run. It
// returns `None` if the program should exit (because a command line
// option asked for a "usage" message, for instance.)

async fn init_app() -> Option<config::Config> {
    // If a configuration is returned, set up the logger.

    if let Some(cfg) = config::get().await {
        // Initialize the log system. The max log level is determined
        // by the user (either through the config file or the command
        // line.)

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("Unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

async fn wrap_task(
    handle: JoinHandle<Result<Infallible>>,
) -> Result<Infallible> {
    match handle.await {
        Err(e) if e.is_panic() => {
            error!("terminated due to panic");
            Err(Error::OperationError("task panicked".to_owned()))
        }

        Err(_) => {
            error!("terminated due to cancellation");
            Err(Error::OperationError("task was canceled".to_owned()))
        }

        Ok(Ok(_)) => unreachable!(),

        Ok(Err(e)) => {
            error!("task returned error -- {}", &e);
            Err(e)
        }
    }
}

// Stands in for the message-bus transport. A real deployment replaces
// this task with an adapter that publishes each command to the broker
// and feeds device feedback into the `RawMessage` sender it holds; in
// its absence, outbound commands go to the log and the feedback
// channel stays quiet.

async fn transport_stub(
    mut rx_cmd: mpsc::Receiver<proto::DeviceCommand>,
    _tx_raw: mpsc::Sender<proto::RawMessage>,
) -> Result<Infallible> {
    while let Some(cmd) = rx_cmd.recv().await {
        info!("publish {}: {}", cmd.routing_key(), cmd.payload())
    }

    Err(Error::MissingPeer("command channel closed".to_string()))
}

// Runs the main body of the application. This top-level task reads
// the config, starts the core and the reconciliation tasks, and
// monitors their health.

async fn run() -> Result<()> {
    if let Some(cfg) = init_app().await {
        // Bad schedule strings should stop the daemon before any
        // task starts.

        let stale_schedule = maintenance::Schedule::parse(
            &cfg.maintenance.stale_detection_cron,
        )?;
        let orphan_schedule = maintenance::Schedule::parse(
            &cfg.maintenance.orphan_cleanup_cron,
        )?;

        let (bus, _bus_rx) = events::channel();

        // Start the core task. It returns the two request handles
        // and the task handle. The client handle is what a REST or
        // fanout surface would hold; it has to stay alive for the
        // core to keep serving.

        let (_client_chan, service_chan, core_task) =
            core::start(&cfg, bus.clone()).await?;

        let mut tasks = vec![wrap_task(core_task)];

        // The transport ends: commands flow out, telemetry flows in.

        let (tx_cmd, rx_cmd) = mpsc::channel(32);
        let (tx_raw, rx_raw) = mpsc::channel(32);

        info!("starting health gate");

        let (healthy, health_task) = health::start(
            cfg.health.failure_threshold,
            cfg.health.recovery_threshold,
            cfg.probe_period(),
            cfg.store_timeout(),
            service_chan.clone(),
            bus.clone(),
        );

        tasks.push(wrap_task(health_task));

        info!("starting reconcilers");

        let (metrics, ir_task) = reconcile::start(
            cfg.debounce(),
            cfg.store_timeout(),
            cfg.publish_timeout(),
            service_chan.clone(),
            bus.subscribe(),
            healthy.clone(),
            tx_cmd.clone(),
        );

        tasks.push(wrap_task(ir_task));
        tasks.push(wrap_task(reconcile::drift::start(
            cfg.drift_period(),
            cfg.store_timeout(),
            cfg.publish_timeout(),
            service_chan.clone(),
            healthy.clone(),
            tx_cmd,
            metrics,
        )));

        info!("starting maintenance jobs");

        tasks.push(wrap_task(maintenance::start_stale_detection(
            stale_schedule,
            cfg.maintenance.stale_threshold_days,
            service_chan.clone(),
        )));
        tasks.push(wrap_task(maintenance::start_orphan_cleanup(
            orphan_schedule,
            service_chan.clone(),
        )));

        info!("starting telemetry ingest");

        tasks.push(wrap_task(tokio::spawn(
            proto::ingest(rx_raw, service_chan)
                .instrument(tracing::info_span!("ingest")),
        )));

        tasks.push(wrap_task(tokio::spawn(
            transport_stub(rx_cmd, tx_raw)
                .instrument(tracing::info_span!("transport")),
        )));

        // Now run all the tasks.

        let _ = future::join_all(tasks).await;

        warn!("shutting down")
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e:?}")
    }
}
