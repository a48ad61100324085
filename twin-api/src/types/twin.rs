//! Defines the three state records that make up a device's digital
//! twin, plus the atomic snapshot view derived from them.

use super::device::{DeviceId, DeviceType, Value};
use super::overrides::OverrideCategory;
use chrono::{DateTime, Utc};
use std::fmt;

/// Names the input layer a desired state was derived from. Safety
/// rules can further constrain the value, but the source stays the
/// override layer (or the user's intent) that proposed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCategory {
    Emergency,
    Maintenance,
    Scheduled,
    Manual,
    UserIntent,
}

impl From<OverrideCategory> for SourceCategory {
    fn from(cat: OverrideCategory) -> Self {
        match cat {
            OverrideCategory::Emergency => SourceCategory::Emergency,
            OverrideCategory::Maintenance => SourceCategory::Maintenance,
            OverrideCategory::Scheduled => SourceCategory::Scheduled,
            OverrideCategory::Manual => SourceCategory::Manual,
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceCategory::Emergency => write!(f, "EMERGENCY"),
            SourceCategory::Maintenance => write!(f, "MAINTENANCE"),
            SourceCategory::Scheduled => write!(f, "SCHEDULED"),
            SourceCategory::Manual => write!(f, "MANUAL"),
            SourceCategory::UserIntent => write!(f, "USER_INTENT"),
        }
    }
}

/// The value a user asked a device to take. Intents are written by
/// the REST surface and survive until explicitly replaced; they are
/// never deleted by the reconcilers.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIntent {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub value: Value,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
}

/// The target value for a device after safety rules and overrides
/// have been applied. Recomputed on any input change; each
/// computation replaces the previous record.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub value: Value,
    pub reason: String,
    pub calculated_at: DateTime<Utc>,
    pub source: SourceCategory,
}

/// The last value a device reported for itself. `is_known` is false
/// only while the actual hardware state has never been confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedState {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub value: Value,
    pub received_at: DateTime<Utc>,
    pub is_known: bool,
}

/// An atomic read of all three twin records for one device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TwinSnapshot {
    pub intent: Option<UserIntent>,
    pub desired: Option<DesiredState>,
    pub reported: Option<ReportedState>,
}

impl TwinSnapshot {
    /// A twin has converged when the device confirmed the value we
    /// want it to have. Missing either side means not converged.
    pub fn is_converged(&self) -> bool {
        match (&self.desired, &self.reported) {
            (Some(desired), Some(reported)) => {
                reported.is_known
                    && desired.device_type == reported.device_type
                    && desired.value == reported.value
            }
            _ => false,
        }
    }

    /// Returns `true` if no record at all exists for the device.
    pub fn is_empty(&self) -> bool {
        self.intent.is_none()
            && self.desired.is_none()
            && self.reported.is_none()
    }
}
