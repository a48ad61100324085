//! Picks the single override in effect for a device.
//!
//! A device can be covered by overrides on itself and, through its
//! functional system, by system-wide ones. The highest category wins;
//! within a category the device-scoped record beats the system-scoped
//! one because it is the more specific statement. Expiry is checked
//! by the store at read time, so an override that lapsed a moment ago
//! never resolves, whether or not the eager sweep got to it.

use twin_api::{
    types::{
        device::DeviceId,
        overrides::{ResolvedOverride, Target},
        system::FunctionalSystem,
    },
    Result,
};

use crate::store::Store;

pub async fn resolve(
    store: &(dyn Store + Send + Sync),
    id: &DeviceId,
    system: Option<&FunctionalSystem>,
) -> Result<Option<ResolvedOverride>> {
    let device_ovs =
        store.overrides_for(&Target::Device(id.clone())).await?;

    let system_ovs = match system {
        Some(sys) => {
            store
                .overrides_for(&Target::System(sys.id.clone()))
                .await?
        }
        None => vec![],
    };

    let winner = device_ovs
        .into_iter()
        .map(|ov| (false, ov))
        .chain(system_ovs.into_iter().map(|ov| (true, ov)))
        .max_by_key(|(from_system, ov)| (ov.category, !*from_system));

    Ok(winner.map(|(from_system, ov)| ResolvedOverride {
        value: ov.value,
        category: ov.category,
        reason: ov.reason,
        from_system,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemStore;
    use chrono::{TimeDelta, Utc};
    use std::collections::HashMap;
    use twin_api::types::{
        device::Value,
        overrides::{Override, OverrideCategory},
        system::FunctionalSystem,
    };

    fn overr(
        target: Target,
        cat: OverrideCategory,
        value: Value,
        reason: &str,
    ) -> Override {
        Override {
            target,
            category: cat,
            value,
            reason: String::from(reason),
            expires_at: None,
            created_at: Utc::now(),
            created_by: String::from("admin"),
            version: 0,
        }
    }

    fn system(id: &str, devices: &[&str]) -> FunctionalSystem {
        FunctionalSystem {
            id: String::from(id),
            kind: String::from("test"),
            name: String::from(id),
            devices: devices.iter().map(|v| v.parse().unwrap()).collect(),
            configuration: toml::value::Table::new(),
            fail_safe_defaults: HashMap::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_no_overrides() {
        let store = MemStore::new();
        let id: DeviceId = "c1:r1".parse().unwrap();

        assert_eq!(resolve(&store, &id, None).await, Ok(None));
    }

    #[tokio::test]
    async fn test_category_precedence() {
        let mut store = MemStore::new();
        let id: DeviceId = "c1:r2".parse().unwrap();
        let target = Target::Device(id.clone());

        store
            .put_override(overr(
                target.clone(),
                OverrideCategory::Manual,
                Value::Relay(false),
                "manual",
            ))
            .await
            .unwrap();
        store
            .put_override(overr(
                target.clone(),
                OverrideCategory::Emergency,
                Value::Relay(true),
                "emergency",
            ))
            .await
            .unwrap();
        store
            .put_override(overr(
                target,
                OverrideCategory::Scheduled,
                Value::Relay(false),
                "scheduled",
            ))
            .await
            .unwrap();

        let got = resolve(&store, &id, None).await.unwrap().unwrap();

        assert_eq!(got.category, OverrideCategory::Emergency);
        assert_eq!(got.value, Value::Relay(true));
        assert!(!got.from_system);
    }

    #[tokio::test]
    async fn test_device_beats_system_within_category() {
        let mut store = MemStore::new();
        let id: DeviceId = "c1:r1".parse().unwrap();
        let sys = system("boiler", &["c1:r1"]);

        store
            .put_override(overr(
                Target::System(String::from("boiler")),
                OverrideCategory::Maintenance,
                Value::Relay(false),
                "system-wide",
            ))
            .await
            .unwrap();
        store
            .put_override(overr(
                Target::Device(id.clone()),
                OverrideCategory::Maintenance,
                Value::Relay(true),
                "just this one",
            ))
            .await
            .unwrap();

        let got = resolve(&store, &id, Some(&sys)).await.unwrap().unwrap();

        assert!(!got.from_system);
        assert_eq!(got.value, Value::Relay(true));

        // A higher category on the system side still wins.

        store
            .put_override(overr(
                Target::System(String::from("boiler")),
                OverrideCategory::Emergency,
                Value::Relay(false),
                "evacuate",
            ))
            .await
            .unwrap();

        let got = resolve(&store, &id, Some(&sys)).await.unwrap().unwrap();

        assert!(got.from_system);
        assert_eq!(got.category, OverrideCategory::Emergency);
    }

    #[tokio::test]
    async fn test_expired_overrides_never_resolve() {
        let mut store = MemStore::new();
        let id: DeviceId = "c1:r1".parse().unwrap();
        let mut ov = overr(
            Target::Device(id.clone()),
            OverrideCategory::Emergency,
            Value::Relay(true),
            "old news",
        );

        ov.expires_at = Some(Utc::now() - TimeDelta::seconds(1));
        store.put_override(ov).await.unwrap();

        assert_eq!(resolve(&store, &id, None).await, Ok(None));
    }
}
