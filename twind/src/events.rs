//! The in-process event bus. Every observable state transition of
//! the control plane is published here; the immediate reconciler and
//! the (external) real-time fanout are subscribers. Per-device
//! ordering is the responsibility of the core task, not of the bus.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use twin_api::types::{
    device::{DeviceId, Value},
    overrides::{OverrideCategory, Target},
};

const CHAN_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A user intent passed the rule chain unchanged.
    IntentAccepted { id: DeviceId, value: Value },

    /// A rule replaced the proposed value before it was applied.
    IntentModified {
        id: DeviceId,
        proposed: Value,
        applied: Value,
        rule: String,
    },

    /// A rule refused the proposed value; the desired state was left
    /// alone.
    IntentRejected {
        id: DeviceId,
        proposed: Value,
        rule: String,
        reason: String,
    },

    /// A new desired state was written for the device. This is the
    /// trigger the immediate reconciler debounces on.
    DesiredCalculated { id: DeviceId, value: Value },

    /// The device reported a state.
    ReportedChanged { id: DeviceId, value: Value },

    /// The reported state caught up with the desired state.
    Converged { id: DeviceId },

    /// The reported and desired states drifted apart.
    Diverged { id: DeviceId },

    OverrideApplied {
        target: Target,
        category: OverrideCategory,
    },

    OverrideCancelled {
        target: Target,
        category: OverrideCategory,
    },

    OverrideExpired {
        target: Target,
        category: OverrideCategory,
    },

    /// The health gate observed a storage component going dark.
    InfrastructureFailure {
        component: String,
        message: String,
        failed_at: DateTime<Utc>,
    },
}

/// Creates the bus. The first receiver is returned alongside the
/// sender so the caller can't lose events published before the first
/// `subscribe()`.
pub fn channel() -> (broadcast::Sender<Event>, broadcast::Receiver<Event>) {
    broadcast::channel(CHAN_SIZE)
}
