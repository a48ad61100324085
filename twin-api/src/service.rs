//! Defines types and interfaces that the daemon's internal service
//! tasks -- the reconcilers, the maintenance jobs, the health gate,
//! and telemetry ingest -- use to interact with the core of twind.
//!
//! These requests never leave the process and are deliberately kept
//! apart from the `client` contract: external surfaces must not be
//! able to feed raw telemetry or touch the reconciliation index.

use crate::{
    types::{
        device::DeviceId,
        twin::{DesiredState, ReportedState, TwinSnapshot},
    },
    Result,
};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

// Defines the requests that can be sent to core.
#[doc(hidden)]
pub enum Request {
    /// Telemetry ingest hands over a parsed actuator report. There is
    /// no reply; a report that cannot be stored is logged and counted
    /// by the core.
    ReportState { state: ReportedState },

    /// Telemetry ingest hands over a temperature reading, which the
    /// core folds into the ambient context given to safety rules.
    ReportTemperature {
        id: DeviceId,
        celsius: f64,
        is_error: bool,
    },

    Snapshot {
        id: DeviceId,
        rpy_chan: oneshot::Sender<Result<TwinSnapshot>>,
    },

    ActiveOutputs {
        rpy_chan: oneshot::Sender<Result<Vec<DesiredState>>>,
    },

    IndexedDevices {
        rpy_chan: oneshot::Sender<Result<Vec<DeviceId>>>,
    },

    LastActivity {
        id: DeviceId,
        rpy_chan: oneshot::Sender<Result<Option<DateTime<Utc>>>>,
    },

    RemoveFromIndex {
        id: DeviceId,
        rpy_chan: oneshot::Sender<Result<()>>,
    },

    /// Probes the storage layer. Used by the health gate.
    Ping {
        rpy_chan: oneshot::Sender<Result<()>>,
    },
}

/// A handle with which internal service tasks communicate with the
/// core of twind. Each task is given a `.clone()` of it at startup.
#[derive(Clone)]
pub struct RequestChan {
    req_chan: mpsc::Sender<Request>,
}

impl RequestChan {
    pub fn new(req_chan: mpsc::Sender<Request>) -> Self {
        RequestChan { req_chan }
    }

    /// Forwards a parsed actuator report to the core.
    pub async fn report_state(&self, state: ReportedState) -> Result<()> {
        self.req_chan
            .send(Request::ReportState { state })
            .await
            .map_err(Into::into)
    }

    /// Forwards a temperature reading to the core.
    pub async fn report_temperature(
        &self,
        id: DeviceId,
        celsius: f64,
        is_error: bool,
    ) -> Result<()> {
        self.req_chan
            .send(Request::ReportTemperature {
                id,
                celsius,
                is_error,
            })
            .await
            .map_err(Into::into)
    }

    /// Reads the twin for one device. Unlike the client surface, an
    /// unknown device yields an empty snapshot instead of an error;
    /// callers sweeping the index expect records to disappear under
    /// them.
    pub async fn snapshot(&self, id: DeviceId) -> Result<TwinSnapshot> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::Snapshot { id, rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Returns the desired state of every indexed output device.
    pub async fn active_outputs(&self) -> Result<Vec<DesiredState>> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::ActiveOutputs { rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Returns the keys of every device in the reconciliation index.
    pub async fn indexed_devices(&self) -> Result<Vec<DeviceId>> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::IndexedDevices { rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// When the device last saw a state write.
    pub async fn last_activity(
        &self,
        id: DeviceId,
    ) -> Result<Option<DateTime<Utc>>> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::LastActivity { id, rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Drops a device from the reconciliation index without touching
    /// its twin records. Used by the orphan cleanup job.
    pub async fn remove_from_index(&self, id: DeviceId) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::RemoveFromIndex { id, rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Asks the core to probe its storage layer.
    pub async fn ping(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.req_chan.send(Request::Ping { rpy_chan: tx }).await?;
        rx.await?
    }
}
