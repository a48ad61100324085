//! The storage facade of the control plane.
//!
//! The `Store` trait is everything the core task needs from a
//! persistence layer: the three twin records per device, the
//! reconciliation index, the override set, and the functional-system
//! catalog. The in-memory backend in this module is the only one
//! compiled in; a networked backend would implement the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use twin_api::{
    types::{
        device::DeviceId,
        overrides::{Override, OverrideCategory, Target},
        system::FunctionalSystem,
        twin::{DesiredState, ReportedState, TwinSnapshot, UserIntent},
    },
    Result,
};

pub(crate) mod memory;

#[async_trait]
pub trait Store {
    /// Saves (or replaces) the user intent for a device. Bumps the
    /// device's activity timestamp.
    async fn save_intent(&mut self, intent: UserIntent) -> Result<()>;

    async fn intent(&self, id: &DeviceId) -> Result<Option<UserIntent>>;

    /// Saves the device's self-reported state. Bumps the activity
    /// timestamp.
    async fn save_reported(&mut self, state: ReportedState) -> Result<()>;

    async fn reported(&self, id: &DeviceId) -> Result<Option<ReportedState>>;

    /// Saves a newly calculated desired state. An output device is
    /// added to the reconciliation index as a side effect. Bumps the
    /// activity timestamp.
    async fn save_desired(&mut self, state: DesiredState) -> Result<()>;

    async fn desired(&self, id: &DeviceId) -> Result<Option<DesiredState>>;

    /// Reads all three twin records in one round-trip. A device with
    /// no records yields an empty snapshot.
    async fn twin_snapshot(&self, id: &DeviceId) -> Result<TwinSnapshot>;

    async fn last_activity(
        &self,
        id: &DeviceId,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Removes all state of a device, including its index entry.
    async fn delete_device(&mut self, id: &DeviceId) -> Result<()>;

    /// The keys of every device subject to reconciliation.
    async fn indexed_devices(&self) -> Result<Vec<DeviceId>>;

    async fn remove_from_index(&mut self, id: &DeviceId) -> Result<()>;

    /// The desired state of every indexed device that still has one.
    async fn active_output_devices(&self) -> Result<Vec<DesiredState>>;

    /// Upserts an override under optimistic concurrency: the given
    /// `version` must match the stored record (0 when creating).
    /// Returns the stored record with its new version.
    async fn put_override(&mut self, ov: Override) -> Result<Override>;

    /// Removes the override stored under `(target, category)`.
    async fn delete_override(
        &mut self,
        target: &Target,
        category: OverrideCategory,
    ) -> Result<()>;

    /// All overrides attached to `target` that have not expired. The
    /// expiry check happens at read time; eager TTL eviction is an
    /// optimization the caller must not rely on.
    async fn overrides_for(&self, target: &Target) -> Result<Vec<Override>>;

    /// Overrides whose TTL has lapsed. The core's sweep deletes these
    /// and announces their expiry.
    async fn expired_overrides(&self) -> Result<Vec<Override>>;

    /// Upserts a functional system under the same optimistic
    /// versioning as overrides. Rejects a membership that would give
    /// a device more than one system.
    async fn put_system(
        &mut self,
        system: FunctionalSystem,
    ) -> Result<FunctionalSystem>;

    async fn system(&self, id: &str) -> Result<Option<FunctionalSystem>>;

    /// The functional system a device belongs to, if any.
    async fn system_of(
        &self,
        id: &DeviceId,
    ) -> Result<Option<FunctionalSystem>>;

    /// Probes the backend. The health gate calls this periodically.
    async fn ping(&self) -> Result<()>;
}

/// Opens the storage backend.
pub async fn open() -> Result<impl Store + Send> {
    Ok(memory::MemStore::new())
}
