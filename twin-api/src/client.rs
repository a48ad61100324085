//! Defines types and interfaces that external surfaces use to
//! interact with the core of twind. The primary clients are the REST
//! handlers and the real-time fanout layer, but any internal task
//! that needs to read a twin or place an intent goes through this
//! module.
//!
//! A task that needs access to twins needs a `client::RequestChan`
//! handle. As twind starts, it should `.clone()` the `RequestChan`
//! connected to the core task.

use crate::{
    types::{
        device::{DeviceId, DeviceType, Value},
        overrides::{Override, OverrideCategory, Target},
        system::FunctionalSystem,
        twin::TwinSnapshot,
    },
    Result,
};
use tokio::sync::{mpsc, oneshot};

/// How an intent fared against the safety rule chain. A refused
/// intent is reported through the `Err` side instead, carrying a
/// `SafetyBlock` value.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    /// The intent was taken as proposed.
    Accepted,

    /// A rule replaced the proposed value. The field holds the value
    /// that was actually applied and the id of the last rule that
    /// touched it.
    Modified { value: Value, rule: String },
}

// Defines the requests that can be sent to core.
#[doc(hidden)]
pub enum Request {
    SetIntent {
        id: DeviceId,
        device_type: DeviceType,
        value: Value,
        requested_by: String,
        rpy_chan: oneshot::Sender<Result<IntentOutcome>>,
    },

    GetTwin {
        id: DeviceId,
        rpy_chan: oneshot::Sender<Result<TwinSnapshot>>,
    },

    DeleteDevice {
        id: DeviceId,
        rpy_chan: oneshot::Sender<Result<()>>,
    },

    PutOverride {
        ov: Override,
        rpy_chan: oneshot::Sender<Result<Override>>,
    },

    DeleteOverride {
        target: Target,
        category: OverrideCategory,
        rpy_chan: oneshot::Sender<Result<()>>,
    },

    PutSystem {
        system: FunctionalSystem,
        rpy_chan: oneshot::Sender<Result<FunctionalSystem>>,
    },

    GetSystem {
        id: String,
        rpy_chan: oneshot::Sender<Result<FunctionalSystem>>,
    },
}

/// A handle which is used to communicate with the core of twind.
/// Clients will be given a handle to be used throughout their life.
///
/// This type wraps the `mpsc::Sender<>` and defines a set of helper
/// methods to send requests and receive replies from the core.
#[derive(Clone)]
pub struct RequestChan {
    req_chan: mpsc::Sender<Request>,
}

impl RequestChan {
    pub fn new(req_chan: mpsc::Sender<Request>) -> Self {
        RequestChan { req_chan }
    }

    /// Places (or replaces) the user intent for a device. The value
    /// must agree with the device type; temperature sensors admit no
    /// intent at all. The reply reports whether a safety rule
    /// modified the proposal.
    pub async fn set_intent(
        &self,
        id: DeviceId,
        device_type: DeviceType,
        value: Value,
        requested_by: String,
    ) -> Result<IntentOutcome> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::SetIntent {
                id,
                device_type,
                value,
                requested_by,
                rpy_chan: tx,
            })
            .await?;
        rx.await?
    }

    /// Reads the full twin for a device in one round-trip.
    pub async fn get_twin(&self, id: DeviceId) -> Result<TwinSnapshot> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::GetTwin { id, rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Removes all three twin records of a device along with its
    /// reconciliation index entry.
    pub async fn delete_device(&self, id: DeviceId) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::DeleteDevice { id, rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Creates or updates an override. The write is optimistic: the
    /// override's `version` must match the stored one (0 for a new
    /// record) or the reply is a `VersionConflict`. On success the
    /// stored record, with its bumped version, is returned.
    pub async fn put_override(&self, ov: Override) -> Result<Override> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::PutOverride { ov, rpy_chan: tx })
            .await?;
        rx.await?
    }

    /// Removes the override stored under `(target, category)`.
    pub async fn delete_override(
        &self,
        target: Target,
        category: OverrideCategory,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::DeleteOverride {
                target,
                category,
                rpy_chan: tx,
            })
            .await?;
        rx.await?
    }

    /// Creates or updates a functional system, subject to the same
    /// optimistic versioning as overrides.
    pub async fn put_system(
        &self,
        system: FunctionalSystem,
    ) -> Result<FunctionalSystem> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::PutSystem {
                system,
                rpy_chan: tx,
            })
            .await?;
        rx.await?
    }

    /// Looks up a functional system by id.
    pub async fn get_system(&self, id: String) -> Result<FunctionalSystem> {
        let (tx, rx) = oneshot::channel();

        self.req_chan
            .send(Request::GetSystem { id, rpy_chan: tx })
            .await?;
        rx.await?
    }
}
