//! Defines functional systems: named groups of devices that share
//! configuration and fail-safe defaults. A device belongs to at most
//! one system.

use super::device::{DeviceId, DeviceType, Value};
use std::collections::HashMap;

/// A group of related devices. System-scoped overrides apply to every
/// member and safety rules look for related devices inside the
/// system's membership. Since each system can control vastly
/// different hardware, `configuration` is kept as a free-form TOML
/// table, the same way driver parameters are.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionalSystem {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub devices: Vec<DeviceId>,
    pub configuration: toml::value::Table,
    pub fail_safe_defaults: HashMap<DeviceType, Value>,
    pub version: u32,
}

impl FunctionalSystem {
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.iter().any(|v| v == id)
    }

    /// The value a member device should take when neither an intent
    /// nor an override proposes one.
    pub fn fail_safe_default(&self, dt: DeviceType) -> Option<Value> {
        self.fail_safe_defaults.get(&dt).copied()
    }
}
