//! Defines prioritized forced values. An override supersedes the
//! user's intent for a device (or for every device of a functional
//! system) until it is deleted or its TTL lapses.

use super::device::{DeviceId, Value};
use crate::types::Error;
use chrono::{DateTime, Utc};
use serde_derive::Deserialize;
use std::{fmt, str::FromStr};

/// The override layers, declared in ascending precedence so the
/// derived ordering ranks `Emergency` above everything else. The two
/// safety tiers are not represented here: they live inside the rule
/// engine and no override can outrank them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideCategory {
    Manual,
    Scheduled,
    Maintenance,
    Emergency,
}

impl fmt::Display for OverrideCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideCategory::Manual => write!(f, "MANUAL"),
            OverrideCategory::Scheduled => write!(f, "SCHEDULED"),
            OverrideCategory::Maintenance => write!(f, "MAINTENANCE"),
            OverrideCategory::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

impl FromStr for OverrideCategory {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(OverrideCategory::Manual),
            "SCHEDULED" => Ok(OverrideCategory::Scheduled),
            "MAINTENANCE" => Ok(OverrideCategory::Maintenance),
            "EMERGENCY" => Ok(OverrideCategory::Emergency),
            _ => Err(Error::ParseError(format!(
                "unknown override category '{}'",
                s
            ))),
        }
    }
}

/// What an override is attached to: a single device or every device
/// belonging to a functional system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Device(DeviceId),
    System(String),
}

impl Target {
    pub fn is_system(&self) -> bool {
        matches!(self, Target::System(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(id) => write!(f, "device {}", id),
            Target::System(id) => write!(f, "system {}", id),
        }
    }
}

/// A prioritized forced value. `(target, category)` uniquely
/// identifies an override; writing to the same pair replaces the
/// previous record under optimistic concurrency on `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub target: Target,
    pub category: OverrideCategory,
    pub value: Value,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub version: u32,
}

impl Override {
    /// An override exactly at its `expires_at` instant is already
    /// expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => false,
        }
    }
}

/// The single override in effect for a device after precedence
/// resolution, along with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOverride {
    pub value: Value,
    pub category: OverrideCategory,
    pub reason: String,
    pub from_system: bool,
}
