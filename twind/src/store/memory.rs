//! Provides a simple, in-memory storage backend.
//!
//! This backend only keeps the latest value of each twin record and
//! loses everything on restart. It is useful for installations doing
//! pure real-time control, and it is the reference implementation of
//! the `Store` contract for the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{hash_map, HashMap, HashSet};
use twin_api::{
    types::{
        device::DeviceId,
        overrides::{Override, OverrideCategory, Target},
        system::FunctionalSystem,
        twin::{DesiredState, ReportedState, TwinSnapshot, UserIntent},
        Error,
    },
    Result,
};

use super::Store;

#[derive(Default)]
struct TwinRecord {
    intent: Option<UserIntent>,
    desired: Option<DesiredState>,
    reported: Option<ReportedState>,
    last_activity: Option<DateTime<Utc>>,
}

impl TwinRecord {
    fn is_empty(&self) -> bool {
        self.intent.is_none()
            && self.desired.is_none()
            && self.reported.is_none()
    }
}

pub struct MemStore {
    twins: HashMap<DeviceId, TwinRecord>,
    index: HashSet<DeviceId>,
    overrides: HashMap<(Target, OverrideCategory), Override>,
    systems: HashMap<String, FunctionalSystem>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            twins: HashMap::new(),
            index: HashSet::new(),
            overrides: HashMap::new(),
            systems: HashMap::new(),
        }
    }

    fn touch(&mut self, id: &DeviceId) {
        self.twins
            .entry(id.clone())
            .or_default()
            .last_activity = Some(Utc::now());
    }
}

// Reads must never hand out a record whose value disagrees with its
// device type. A mismatch can only mean the stored bytes rotted or
// were written by a foreign process, so it surfaces as corrupt state
// rather than a validation error.

fn check_intent(v: &UserIntent) -> Result<()> {
    v.value.validate_for(v.device_type).map_err(|_| {
        Error::CorruptState(format!("intent of {} has a foreign value", v.id))
    })
}

fn check_desired(v: &DesiredState) -> Result<()> {
    v.value.validate_for(v.device_type).map_err(|_| {
        Error::CorruptState(format!("desired of {} has a foreign value", v.id))
    })
}

fn check_reported(v: &ReportedState) -> Result<()> {
    v.value.validate_for(v.device_type).map_err(|_| {
        Error::CorruptState(format!(
            "reported of {} has a foreign value",
            v.id
        ))
    })
}

#[async_trait]
impl Store for MemStore {
    async fn save_intent(&mut self, intent: UserIntent) -> Result<()> {
        intent.value.validate_for(intent.device_type)?;

        let id = intent.id.clone();

        self.twins.entry(id.clone()).or_default().intent = Some(intent);
        self.touch(&id);
        Ok(())
    }

    async fn intent(&self, id: &DeviceId) -> Result<Option<UserIntent>> {
        match self.twins.get(id).and_then(|rec| rec.intent.clone()) {
            Some(v) => {
                check_intent(&v)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn save_reported(&mut self, state: ReportedState) -> Result<()> {
        state.value.validate_for(state.device_type)?;

        let id = state.id.clone();

        self.twins.entry(id.clone()).or_default().reported = Some(state);
        self.touch(&id);
        Ok(())
    }

    async fn reported(&self, id: &DeviceId) -> Result<Option<ReportedState>> {
        match self.twins.get(id).and_then(|rec| rec.reported.clone()) {
            Some(v) => {
                check_reported(&v)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn save_desired(&mut self, state: DesiredState) -> Result<()> {
        state.value.validate_for(state.device_type)?;

        let id = state.id.clone();

        if state.device_type.is_output() {
            self.index.insert(id.clone());
        }
        self.twins.entry(id.clone()).or_default().desired = Some(state);
        self.touch(&id);
        Ok(())
    }

    async fn desired(&self, id: &DeviceId) -> Result<Option<DesiredState>> {
        match self.twins.get(id).and_then(|rec| rec.desired.clone()) {
            Some(v) => {
                check_desired(&v)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn twin_snapshot(&self, id: &DeviceId) -> Result<TwinSnapshot> {
        match self.twins.get(id) {
            Some(rec) => {
                if let Some(ref v) = rec.intent {
                    check_intent(v)?
                }
                if let Some(ref v) = rec.desired {
                    check_desired(v)?
                }
                if let Some(ref v) = rec.reported {
                    check_reported(v)?
                }
                Ok(TwinSnapshot {
                    intent: rec.intent.clone(),
                    desired: rec.desired.clone(),
                    reported: rec.reported.clone(),
                })
            }
            None => Ok(TwinSnapshot::default()),
        }
    }

    async fn last_activity(
        &self,
        id: &DeviceId,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.twins.get(id).and_then(|rec| rec.last_activity))
    }

    async fn delete_device(&mut self, id: &DeviceId) -> Result<()> {
        self.twins.remove(id);
        self.index.remove(id);
        Ok(())
    }

    async fn indexed_devices(&self) -> Result<Vec<DeviceId>> {
        Ok(self.index.iter().cloned().collect())
    }

    async fn remove_from_index(&mut self, id: &DeviceId) -> Result<()> {
        self.index.remove(id);
        Ok(())
    }

    async fn active_output_devices(&self) -> Result<Vec<DesiredState>> {
        let mut result = Vec::with_capacity(self.index.len());

        for id in &self.index {
            if let Some(v) = self.twins.get(id).and_then(|r| r.desired.clone())
            {
                check_desired(&v)?;
                result.push(v)
            }
        }
        Ok(result)
    }

    async fn put_override(&mut self, ov: Override) -> Result<Override> {
        ov.value.validate_for(ov.value.device_type())?;

        let key = (ov.target.clone(), ov.category);

        match self.overrides.entry(key) {
            hash_map::Entry::Vacant(e) => {
                if ov.version != 0 {
                    return Err(Error::VersionConflict);
                }

                let stored = Override { version: 1, ..ov };

                e.insert(stored.clone());
                Ok(stored)
            }
            hash_map::Entry::Occupied(mut e) => {
                if ov.version != e.get().version {
                    return Err(Error::VersionConflict);
                }

                let stored = Override {
                    version: ov.version + 1,
                    ..ov
                };

                e.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn delete_override(
        &mut self,
        target: &Target,
        category: OverrideCategory,
    ) -> Result<()> {
        self.overrides
            .remove(&(target.clone(), category))
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    async fn overrides_for(&self, target: &Target) -> Result<Vec<Override>> {
        let now = Utc::now();

        Ok(self
            .overrides
            .values()
            .filter(|ov| &ov.target == target && !ov.is_expired(now))
            .cloned()
            .collect())
    }

    async fn expired_overrides(&self) -> Result<Vec<Override>> {
        let now = Utc::now();

        Ok(self
            .overrides
            .values()
            .filter(|ov| ov.is_expired(now))
            .cloned()
            .collect())
    }

    async fn put_system(
        &mut self,
        system: FunctionalSystem,
    ) -> Result<FunctionalSystem> {
        // Membership is exclusive across systems.

        for dev in &system.devices {
            if let Some(other) = self
                .systems
                .values()
                .find(|s| s.id != system.id && s.contains(dev))
            {
                return Err(Error::InvArgument(format!(
                    "device {} already belongs to system {}",
                    dev, other.id
                )));
            }
        }

        match self.systems.entry(system.id.clone()) {
            hash_map::Entry::Vacant(e) => {
                if system.version != 0 {
                    return Err(Error::VersionConflict);
                }

                let stored = FunctionalSystem {
                    version: 1,
                    ..system
                };

                e.insert(stored.clone());
                Ok(stored)
            }
            hash_map::Entry::Occupied(mut e) => {
                if system.version != e.get().version {
                    return Err(Error::VersionConflict);
                }

                let stored = FunctionalSystem {
                    version: system.version + 1,
                    ..system
                };

                e.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn system(&self, id: &str) -> Result<Option<FunctionalSystem>> {
        Ok(self.systems.get(id).cloned())
    }

    async fn system_of(
        &self,
        id: &DeviceId,
    ) -> Result<Option<FunctionalSystem>> {
        Ok(self.systems.values().find(|s| s.contains(id)).cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use twin_api::types::{
        device::{DeviceType, Value},
        twin::SourceCategory,
    };

    fn intent(id: &str, v: Value) -> UserIntent {
        UserIntent {
            id: id.parse().unwrap(),
            device_type: v.device_type(),
            value: v,
            requested_at: Utc::now(),
            requested_by: String::from("test"),
        }
    }

    fn desired(id: &str, v: Value) -> DesiredState {
        DesiredState {
            id: id.parse().unwrap(),
            device_type: v.device_type(),
            value: v,
            reason: String::from("test"),
            calculated_at: Utc::now(),
            source: SourceCategory::UserIntent,
        }
    }

    fn overr(target: Target, cat: OverrideCategory, version: u32) -> Override {
        Override {
            target,
            category: cat,
            value: Value::Relay(true),
            reason: String::from("test"),
            expires_at: None,
            created_at: Utc::now(),
            created_by: String::from("admin"),
            version,
        }
    }

    #[tokio::test]
    async fn test_twin_records() {
        let mut s = MemStore::new();
        let id: DeviceId = "c1:r1".parse().unwrap();

        assert_eq!(s.intent(&id).await, Ok(None));
        assert_eq!(s.last_activity(&id).await, Ok(None));
        assert!(s.twin_snapshot(&id).await.unwrap().is_empty());

        s.save_intent(intent("c1:r1", Value::Relay(true)))
            .await
            .unwrap();

        assert!(s.intent(&id).await.unwrap().is_some());
        assert!(s.last_activity(&id).await.unwrap().is_some());

        // Intents alone don't index the device.

        assert!(s.indexed_devices().await.unwrap().is_empty());

        s.save_desired(desired("c1:r1", Value::Relay(true)))
            .await
            .unwrap();

        assert_eq!(s.indexed_devices().await.unwrap(), vec![id.clone()]);
        assert_eq!(s.active_output_devices().await.unwrap().len(), 1);

        s.delete_device(&id).await.unwrap();

        assert!(s.twin_snapshot(&id).await.unwrap().is_empty());
        assert!(s.indexed_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_side_validation() {
        let mut s = MemStore::new();

        let mut bad = intent("c1:r1", Value::Relay(true));

        bad.device_type = DeviceType::Fan;
        assert_eq!(s.save_intent(bad).await, Err(Error::TypeError));

        let mut bad = desired("c1:f1", Value::Fan(2));

        bad.value = Value::Fan(9);
        assert!(s.save_desired(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_state_read() {
        let mut s = MemStore::new();
        let id: DeviceId = "c1:r1".parse().unwrap();

        // Inject a record whose value disagrees with its type,
        // bypassing the write-side checks.

        let mut rec = desired("c1:r1", Value::Relay(true));

        rec.device_type = DeviceType::Fan;
        s.twins.entry(id.clone()).or_default().desired = Some(rec);

        assert!(matches!(
            s.desired(&id).await,
            Err(Error::CorruptState(_))
        ));
        assert!(matches!(
            s.twin_snapshot(&id).await,
            Err(Error::CorruptState(_))
        ));
    }

    #[tokio::test]
    async fn test_override_versioning() {
        let mut s = MemStore::new();
        let target = Target::Device("c1:r1".parse().unwrap());

        // Creating with a stale version is refused.

        assert_eq!(
            s.put_override(overr(target.clone(), OverrideCategory::Manual, 3))
                .await,
            Err(Error::VersionConflict)
        );

        let stored = s
            .put_override(overr(target.clone(), OverrideCategory::Manual, 0))
            .await
            .unwrap();

        assert_eq!(stored.version, 1);

        // An update must carry the stored version.

        assert_eq!(
            s.put_override(overr(target.clone(), OverrideCategory::Manual, 0))
                .await,
            Err(Error::VersionConflict)
        );

        let stored = s
            .put_override(overr(target.clone(), OverrideCategory::Manual, 1))
            .await
            .unwrap();

        assert_eq!(stored.version, 2);

        // Different categories are independent records.

        let other = s
            .put_override(overr(
                target.clone(),
                OverrideCategory::Emergency,
                0,
            ))
            .await
            .unwrap();

        assert_eq!(other.version, 1);
        assert_eq!(s.overrides_for(&target).await.unwrap().len(), 2);

        s.delete_override(&target, OverrideCategory::Manual)
            .await
            .unwrap();
        assert_eq!(
            s.delete_override(&target, OverrideCategory::Manual).await,
            Err(Error::NotFound)
        );
    }

    #[tokio::test]
    async fn test_override_expiry_is_checked_on_read() {
        let mut s = MemStore::new();
        let target = Target::Device("c1:r1".parse().unwrap());
        let mut ov = overr(target.clone(), OverrideCategory::Emergency, 0);

        ov.expires_at = Some(Utc::now() - TimeDelta::seconds(1));
        s.put_override(ov).await.unwrap();

        assert!(s.overrides_for(&target).await.unwrap().is_empty());
        assert_eq!(s.expired_overrides().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_system_membership_is_exclusive() {
        let mut s = MemStore::new();

        let sys = FunctionalSystem {
            id: String::from("boiler"),
            kind: String::from("heating"),
            name: String::from("Boiler"),
            devices: vec!["c1:pump".parse().unwrap()],
            configuration: toml::value::Table::new(),
            fail_safe_defaults: HashMap::new(),
            version: 0,
        };

        let stored = s.put_system(sys.clone()).await.unwrap();

        assert_eq!(stored.version, 1);

        let rival = FunctionalSystem {
            id: String::from("hvac"),
            ..sys.clone()
        };

        assert!(matches!(
            s.put_system(rival).await,
            Err(Error::InvArgument(_))
        ));

        assert_eq!(
            s.system_of(&"c1:pump".parse().unwrap())
                .await
                .unwrap()
                .unwrap()
                .id,
            "boiler"
        );
        assert_eq!(s.system_of(&"c1:x".parse().unwrap()).await, Ok(None));
    }
}
